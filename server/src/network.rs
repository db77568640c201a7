//! Server event loop: TCP game sessions, UDP storage lookups and ring links

use crate::game::World;
use crate::peer::{JoinOutcome, RingProtocol, RingStatus};
use crate::session::{ConnId, ConnectionEvent, SessionRegistry};
use crate::storage::StorageService;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use shared::datagram::Datagram;
use shared::reliable::Mode;
use shared::ring::ServerEntry;
use shared::roster::Roster;
use shared::stream::StreamMessage;
use shared::udp_engine::{DatagramHandler, Outbox, UdpEngine};
use shared::user_store::FileUserStore;
use shared::{Error, Result, UserRecord};
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};

/// How often the ring state machine and deferred connections are serviced
pub const TICK: Duration = Duration::from_millis(10);

/// Error code of an `InvalidState` reply to a command sent before login
pub const NOT_LOGGED_IN: u8 = 0;
/// Error code of an `InvalidState` reply to a second login
pub const ALREADY_LOGGED_IN: u8 = 1;
/// Error code of a `LoginReply` refusing a name already in game
pub const NAME_TAKEN: u8 = 1;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address other servers and the tracker know us by
    pub ip: Ipv4Addr,
    pub tcp_port: u16,
    pub udp_port: u16,
    pub roster: PathBuf,
    pub users_dir: PathBuf,
}

/// What to do with a connection after one of its messages was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Continue,
    /// Leave the rest of the buffer for the next tick
    Yield,
    Close,
}

pub struct Server {
    listener: TcpListener,
    udp: UdpEngine,
    sessions: SessionRegistry,
    world: World,
    storage: StorageService<FileUserStore>,
    ring: RingProtocol,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    deferred: VecDeque<ConnId>,
    rng: StdRng,
    status: watch::Sender<RingStatus>,
}

impl Server {
    /// Binds both sockets on all interfaces. Port 0 picks a free port; the
    /// ring id is derived from the port actually bound.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, config.tcp_port)).await?;
        let tcp_port = listener.local_addr()?.port();
        let udp = UdpEngine::bind(
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.udp_port)),
            Mode::NoResend,
        )
        .await?;
        let udp_port = udp.local_addr()?.port();

        let me = ServerEntry::for_address(config.ip, tcp_port, Some(udp_port));
        info!(
            "Server {} listening on tcp {} and udp {}",
            me.ring_id, tcp_port, udp_port
        );
        let store = FileUserStore::open(&config.users_dir)?;
        let ring = RingProtocol::new(Roster::new(config.roster, me));
        let (status, _) = watch::channel(ring.status());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        Ok(Self {
            listener,
            udp,
            sessions: SessionRegistry::new(),
            world: World::new(),
            storage: StorageService::new(store),
            ring,
            events_tx,
            events_rx,
            deferred: VecDeque::new(),
            rng: StdRng::from_entropy(),
            status,
        })
    }

    pub fn tcp_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn udp_addr(&self) -> Result<SocketAddr> {
        self.udp.local_addr()
    }

    pub fn ring_id(&self) -> u32 {
        self.ring.ring_id()
    }

    /// Receiver of ring membership changes
    pub fn status(&self) -> watch::Receiver<RingStatus> {
        self.status.subscribe()
    }

    /// Runs until a fatal ring error. Per-connection failures only close the
    /// affected connection.
    pub async fn run(&mut self) -> Result<()> {
        let mut tick = interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        self.sessions.accept(stream, addr, &self.events_tx);
                    }
                    Err(e) => warn!("accept failed: {}", e),
                },
                received = self.udp.recv() => match received {
                    Ok(Some(datagram)) => self.handle_datagram(datagram).await,
                    Ok(None) => {}
                    Err(e) => warn!("UDP receive failed: {}", e),
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = tick.tick() => {
                    self.ring.advance(&mut self.sessions, &self.events_tx).await?;
                    self.process_deferred();
                    self.publish_status();
                }
            }
        }
    }

    fn publish_status(&self) {
        let status = self.ring.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    async fn handle_datagram(&mut self, datagram: Datagram) {
        let mut outbox = Outbox::new();
        if let Err(e) = self.storage.handle(&datagram, &mut outbox) {
            warn!("storage request from {} failed: {}", datagram.source, e);
        }
        if let Err(e) = self.udp.flush(&mut outbox).await {
            warn!("cannot answer {}: {}", datagram.source, e);
        }
        for record in self.storage.take_saved() {
            self.ring.replicate(&record, &self.sessions);
        }
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Data { conn, bytes } => {
                let Some(session) = self.sessions.lookup_mut(conn) else {
                    return;
                };
                session.buffer.extend(&bytes);
                if !self.deferred.contains(&conn) {
                    self.process_buffer(conn);
                }
            }
            ConnectionEvent::Closed { conn } => {
                if self.sessions.contains(conn) {
                    info!("Connection {} closed by peer", conn);
                    self.disconnect(conn);
                }
            }
        }
    }

    fn process_deferred(&mut self) {
        let pending: Vec<ConnId> = self.deferred.drain(..).collect();
        for conn in pending {
            self.process_buffer(conn);
        }
    }

    /// Handles every complete message buffered for `conn`, in arrival order.
    fn process_buffer(&mut self, conn: ConnId) {
        loop {
            let next = match self.sessions.lookup_mut(conn) {
                Some(session) => session.buffer.next_message(),
                None => return,
            };
            let message = match next {
                Ok(Some(message)) => message,
                Ok(None) => return,
                Err(e) => {
                    warn!("Malformed message on conn {}: {}", conn, e);
                    self.disconnect(conn);
                    return;
                }
            };
            debug!("conn {} received {:?}", conn, message.kind());

            match self.dispatch(conn, message) {
                Ok(Dispatch::Continue) => {}
                Ok(Dispatch::Yield) => {
                    if !self.deferred.contains(&conn) {
                        self.deferred.push_back(conn);
                    }
                    return;
                }
                Ok(Dispatch::Close) => {
                    self.disconnect(conn);
                    return;
                }
                Err(e) => {
                    warn!("Closing conn {}: {}", conn, e);
                    self.disconnect(conn);
                    return;
                }
            }
        }
    }

    fn dispatch(&mut self, conn: ConnId, message: StreamMessage) -> Result<Dispatch> {
        let player = self.sessions.lookup(conn).and_then(|s| s.player.clone());

        match message {
            StreamMessage::LoginRequest(record) => self.login(conn, player.is_some(), record),
            StreamMessage::Move { .. }
            | StreamMessage::Attack { .. }
            | StreamMessage::Speak { .. }
            | StreamMessage::Logout
                if player.is_none() =>
            {
                self.sessions.send(
                    conn,
                    &StreamMessage::InvalidState {
                        error_code: NOT_LOGGED_IN,
                    },
                )?;
                Ok(Dispatch::Continue)
            }
            StreamMessage::Move { direction } => {
                let name = player.unwrap_or_default();
                if let Some(record) = self.world.move_player(&name, direction) {
                    self.sessions.broadcast(&StreamMessage::MoveNotify(record))?;
                }
                Ok(Dispatch::Continue)
            }
            StreamMessage::Attack { victim } => {
                let attacker = player.unwrap_or_default();
                self.attack(&attacker, &victim)?;
                Ok(Dispatch::Continue)
            }
            StreamMessage::Speak { text } => {
                let speaker = player.unwrap_or_default();
                self.sessions
                    .broadcast(&StreamMessage::SpeakNotify { speaker, text })?;
                Ok(Dispatch::Continue)
            }
            StreamMessage::Logout => {
                let name = player.unwrap_or_default();
                if let Some(record) = self.world.remove(&name) {
                    info!("Player {} has left the tiny world of warcraft.", name);
                    self.sessions.broadcast(&StreamMessage::LogoutNotify(record))?;
                }
                if let Some(session) = self.sessions.lookup_mut(conn) {
                    session.player = None;
                }
                Ok(Dispatch::Close)
            }
            StreamMessage::JoinRequest { ring_id } => {
                let outcome =
                    self.ring
                        .on_join_request(conn, ring_id, &self.sessions, self.storage.store())?;
                match outcome {
                    JoinOutcome::Replaced { previous } => {
                        if let Some(previous) = previous {
                            info!("P2P: dropping displaced successor conn {}", previous);
                            self.disconnect(previous);
                        }
                        Ok(Dispatch::Yield)
                    }
                    JoinOutcome::Answered | JoinOutcome::Ignored => Ok(Dispatch::Continue),
                }
            }
            StreamMessage::JoinResponse { users } => {
                if self
                    .ring
                    .on_join_response(conn, users, self.storage.store_mut())
                {
                    Ok(Dispatch::Yield)
                } else {
                    Ok(Dispatch::Continue)
                }
            }
            StreamMessage::BackupRequest(record) => {
                self.ring
                    .on_backup_request(conn, record, &self.sessions, self.storage.store_mut())?;
                Ok(Dispatch::Continue)
            }
            StreamMessage::BackupResponse { status } => {
                self.ring.on_backup_response(conn, status);
                Ok(Dispatch::Continue)
            }
            other => Err(Error::violation(format!(
                "{:?} is only sent by servers",
                other.kind()
            ))),
        }
    }

    fn login(&mut self, conn: ConnId, logged_in: bool, record: UserRecord) -> Result<Dispatch> {
        if logged_in {
            self.sessions.send(
                conn,
                &StreamMessage::InvalidState {
                    error_code: ALREADY_LOGGED_IN,
                },
            )?;
            return Ok(Dispatch::Continue);
        }
        if !self.world.admit(record.clone()) {
            info!("A player with the same name {} is already in the game.", record.name);
            self.sessions.send(
                conn,
                &StreamMessage::LoginReply {
                    error_code: NAME_TAKEN,
                    hp: 0,
                    exp: 0,
                    x: 0,
                    y: 0,
                },
            )?;
            return Ok(Dispatch::Continue);
        }

        self.sessions.send(
            conn,
            &StreamMessage::LoginReply {
                error_code: 0,
                hp: record.hp,
                exp: record.exp,
                x: record.x,
                y: record.y,
            },
        )?;
        if let Some(session) = self.sessions.lookup_mut(conn) {
            session.player = Some(record.name.clone());
        }
        for other in self.world.players().filter(|p| p.name != record.name) {
            self.sessions
                .send(conn, &StreamMessage::MoveNotify(other.clone()))?;
        }
        self.sessions.broadcast(&StreamMessage::MoveNotify(record))?;
        Ok(Dispatch::Continue)
    }

    fn attack(&mut self, attacker: &str, victim: &str) -> Result<()> {
        let Some(outcome) = self.world.attack(attacker, victim, &mut self.rng) else {
            debug!("ignoring attack of {} on {}", attacker, victim);
            return Ok(());
        };
        self.sessions.broadcast(&StreamMessage::AttackNotify {
            attacker: attacker.to_string(),
            victim: victim.to_string(),
            damage: outcome.damage as u8,
            hp: outcome.victim_hp,
        })?;
        if outcome.resurrected_hp.is_some() {
            if let Some(record) = self.world.get(victim) {
                self.sessions
                    .broadcast(&StreamMessage::MoveNotify(record.clone()))?;
            }
        }
        Ok(())
    }

    /// Drops a connection and everything attached to it.
    fn disconnect(&mut self, conn: ConnId) {
        let Some(session) = self.sessions.remove(conn) else {
            return;
        };
        if let Some(name) = session.player {
            if let Some(record) = self.world.remove(&name) {
                info!("Player {} has left the tiny world of warcraft.", name);
                if let Err(e) = self.sessions.broadcast(&StreamMessage::LogoutNotify(record)) {
                    warn!("cannot announce logout of {}: {}", name, e);
                }
            }
        }
        self.ring.on_disconnect(conn);
        self.deferred.retain(|pending| *pending != conn);
        debug!("conn {} removed, {} sessions left", conn, self.sessions.len());
    }
}
