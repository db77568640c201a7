//! Player-state service answering datagram lookups and saves.

use crate::game::fresh_player;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::datagram::{Datagram, UdpMessage};
use shared::udp_engine::{DatagramHandler, Flow, Outbox};
use shared::user_store::UserStore;
use shared::{Result, UserRecord};

pub const SAVE_OK: u8 = 0;
pub const SAVE_FAILED: u8 = 1;

pub struct StorageService<S> {
    store: S,
    rng: StdRng,
    /// Records saved since the last `take_saved`, waiting to be backed up.
    saved: Vec<UserRecord>,
}

impl<S: UserStore> StorageService<S> {
    pub fn new(store: S) -> Self {
        Self::with_rng(store, StdRng::from_entropy())
    }

    pub fn with_rng(store: S, rng: StdRng) -> Self {
        Self {
            store,
            rng,
            saved: Vec::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn take_saved(&mut self) -> Vec<UserRecord> {
        std::mem::take(&mut self.saved)
    }

    /// Stored state of `name`, creating and persisting a new player on first
    /// sight.
    fn player_state(&mut self, name: &str) -> Result<UserRecord> {
        if let Some(record) = self.store.load(name)? {
            return Ok(record);
        }
        let record = fresh_player(name, &mut self.rng);
        self.store.save(&record)?;
        info!("created new player {} with {} hp", name, record.hp);
        Ok(record)
    }

    fn save_state(&mut self, record: UserRecord) -> u8 {
        match self.store.save(&record) {
            Ok(()) => {
                debug!("saved state of {}", record.name);
                self.saved.push(record);
                SAVE_OK
            }
            Err(e) => {
                warn!("cannot save state of {}: {}", record.name, e);
                SAVE_FAILED
            }
        }
    }
}

impl<S: UserStore> DatagramHandler for StorageService<S> {
    fn handle(&mut self, datagram: &Datagram, outbox: &mut Outbox) -> Result<Flow> {
        let message = match datagram.message() {
            Ok(message) => message,
            Err(e) => {
                warn!("Received malformed UDP packet from {}: {}", datagram.source, e);
                return Ok(Flow::Continue);
            }
        };

        match message {
            UdpMessage::PlayerStateRequest { name } => match self.player_state(&name) {
                Ok(record) => outbox.send(
                    datagram.source,
                    datagram.sequence_id,
                    UdpMessage::PlayerStateResponse(record),
                ),
                Err(e) => warn!("cannot load player {}: {}", name, e),
            },
            UdpMessage::SaveStateRequest(record) => {
                let error_code = self.save_state(record);
                outbox.send(
                    datagram.source,
                    datagram.sequence_id,
                    UdpMessage::SaveStateResponse { error_code },
                );
            }
            other => warn!(
                "unexpected {:?} datagram from {}",
                other.kind(),
                datagram.source
            ),
        }
        Ok(Flow::Continue)
    }
}
