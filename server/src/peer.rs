//! Ring membership protocol
//!
//! Every server keeps TCP links to its ring neighbours. On startup it joins
//! the ring by sending a join request to its predecessor and successor; each
//! neighbour hands over the user records that now belong to the newcomer.
//! While active, every saved record is copied to the successor, and losing
//! the successor link triggers a search for the next one.

use crate::session::{ConnId, ConnectionEvent, SessionRegistry};
use log::{debug, info, warn};
use shared::ring::{KeyRange, PeerRelation, Ring, RING_SIZE};
use shared::roster::Roster;
use shared::stream::StreamMessage;
use shared::user_store::UserStore;
use shared::{Error, Result, UserRecord};
use std::collections::BTreeMap;
use tokio::sync::mpsc;

pub const BACKUP_OK: u8 = 0;
pub const BACKUP_FAILED: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingState {
    Inactive,
    ConnectingToPeers,
    SendJoin,
    AwaitJoinResponses,
    Active,
    FindNewSuccessor,
}

/// A connection to a ring neighbour
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerLink {
    pub conn: ConnId,
    pub ring_id: u32,
}

/// Snapshot of the membership state, published for observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingStatus {
    pub state: RingState,
    pub predecessor: Option<u32>,
    pub successor: Option<u32>,
}

/// What the event loop must do after a join request was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    Ignored,
    Answered,
    /// The peer became our successor. `previous` is the displaced successor
    /// connection, to be closed by the caller.
    Replaced { previous: Option<ConnId> },
}

#[derive(Debug)]
pub struct RingProtocol {
    state: RingState,
    roster: Roster,
    ring: Ring,
    me: u32,
    predecessor: Option<PeerLink>,
    successor: Option<PeerLink>,
    join_legs: u32,
    join_responses: u32,
}

impl RingProtocol {
    pub fn new(roster: Roster) -> Self {
        let me = roster.me().ring_id;
        Self {
            state: RingState::Inactive,
            roster,
            ring: Ring::default(),
            me,
            predecessor: None,
            successor: None,
            join_legs: 0,
            join_responses: 0,
        }
    }

    pub fn state(&self) -> RingState {
        self.state
    }

    pub fn ring_id(&self) -> u32 {
        self.me
    }

    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    pub fn predecessor(&self) -> Option<PeerLink> {
        self.predecessor
    }

    pub fn successor(&self) -> Option<PeerLink> {
        self.successor
    }

    pub fn status(&self) -> RingStatus {
        RingStatus {
            state: self.state,
            predecessor: self.predecessor.map(|link| link.ring_id),
            successor: self.successor.map(|link| link.ring_id),
        }
    }

    fn set_state(&mut self, state: RingState) {
        if self.state != state {
            debug!("P2P: {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn reload(&mut self) -> Result<()> {
        self.ring = self.roster.load()?;
        Ok(())
    }

    /// Runs one step of the membership state machine.
    ///
    /// Errors are fatal for the server: a broken roster, a malformed ring or
    /// a neighbour that cannot be reached while joining.
    pub async fn advance(
        &mut self,
        sessions: &mut SessionRegistry,
        events: &mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<()> {
        match self.state {
            RingState::Inactive => {
                self.reload()?;
                self.set_state(RingState::ConnectingToPeers);
            }
            RingState::ConnectingToPeers => self.connect_to_peers(sessions, events).await?,
            RingState::SendJoin => self.send_join(sessions)?,
            RingState::AwaitJoinResponses => {
                if self.join_responses >= self.join_legs {
                    info!(
                        "P2P: joined the ring as {} after {} join responses",
                        self.me, self.join_responses
                    );
                    self.join_responses = 0;
                    self.join_legs = 0;
                    self.set_state(RingState::Active);
                }
            }
            RingState::Active => {}
            RingState::FindNewSuccessor => {
                self.find_new_successor(sessions, events).await;
                self.set_state(RingState::Active);
            }
        }
        Ok(())
    }

    async fn connect_to_peers(
        &mut self,
        sessions: &mut SessionRegistry,
        events: &mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<()> {
        let predecessor = self.ring.predecessor(self.me).cloned();
        let successor = self.ring.successor(self.me).cloned();

        match (predecessor, successor) {
            (None, None) => {
                info!("P2P: I'm the first.");
                self.set_state(RingState::Active);
            }
            (Some(predecessor), Some(successor)) => {
                let conn = sessions.connect(predecessor.tcp_addr(), events).await?;
                info!("P2P: connected to predecessor {} (conn {})", predecessor.ring_id, conn);
                self.predecessor = Some(PeerLink {
                    conn,
                    ring_id: predecessor.ring_id,
                });

                let conn = if successor.ring_id == predecessor.ring_id {
                    conn
                } else {
                    let conn = sessions.connect(successor.tcp_addr(), events).await?;
                    info!("P2P: connected to successor {} (conn {})", successor.ring_id, conn);
                    conn
                };
                self.successor = Some(PeerLink {
                    conn,
                    ring_id: successor.ring_id,
                });
                self.set_state(RingState::SendJoin);
            }
            _ => {
                return Err(Error::violation(format!(
                    "ring {} has a predecessor or a successor but not both",
                    self.ring
                )))
            }
        }
        Ok(())
    }

    fn send_join(&mut self, sessions: &SessionRegistry) -> Result<()> {
        let request = StreamMessage::JoinRequest { ring_id: self.me };
        self.join_legs = 0;
        self.join_responses = 0;

        if let Some(link) = self.predecessor {
            sessions.send(link.conn, &request)?;
            self.join_legs += 1;
        }
        if let Some(link) = self.successor {
            if Some(link.conn) != self.predecessor.map(|p| p.conn) {
                sessions.send(link.conn, &request)?;
                self.join_legs += 1;
            }
        }
        info!("P2P: sent {} join requests", self.join_legs);
        self.set_state(RingState::AwaitJoinResponses);
        Ok(())
    }

    async fn find_new_successor(
        &mut self,
        sessions: &mut SessionRegistry,
        events: &mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        if let Err(e) = self.reload() {
            warn!("P2P: cannot reload roster: {}", e);
            return;
        }
        let target = self
            .ring
            .successor(self.me)
            .and_then(|lost| self.ring.successor(lost.ring_id))
            .cloned();

        let Some(target) = target.filter(|entry| entry.ring_id != self.me) else {
            info!("P2P: no successor left, running alone");
            self.successor = None;
            return;
        };

        if let Some(predecessor) = self.predecessor.filter(|p| p.ring_id == target.ring_id) {
            info!("P2P: predecessor {} is now also the successor", target.ring_id);
            self.successor = Some(predecessor);
            return;
        }

        match sessions.connect(target.tcp_addr(), events).await {
            Ok(conn) => {
                info!("P2P: new successor {} (conn {})", target.ring_id, conn);
                self.successor = Some(PeerLink {
                    conn,
                    ring_id: target.ring_id,
                });
            }
            Err(e) => {
                warn!("P2P: cannot reach new successor {}: {}", target.ring_id, e);
                self.successor = None;
            }
        }
    }

    /// Hands the joining peer the records it now owns.
    pub fn on_join_request<S: UserStore>(
        &mut self,
        conn: ConnId,
        peer_id: u32,
        sessions: &SessionRegistry,
        store: &S,
    ) -> Result<JoinOutcome> {
        if peer_id >= RING_SIZE {
            return Err(Error::malformed(format!("join request from ring id {}", peer_id)));
        }
        self.reload()?;
        let me = self
            .ring
            .get(self.me)
            .cloned()
            .ok_or_else(|| Error::violation(format!("{} is not in the ring", self.me)))?;
        let link = PeerLink {
            conn,
            ring_id: peer_id,
        };

        let relation = self.ring.classify(self.me, peer_id);
        info!("P2P: join request from {} ({:?})", peer_id, relation);

        let outcome = match relation {
            PeerRelation::Unrelated => return Ok(JoinOutcome::Ignored),
            PeerRelation::Predecessor => {
                self.answer_join(conn, &[me.backup_range], sessions, store)?;
                self.predecessor = Some(link);
                JoinOutcome::Answered
            }
            PeerRelation::Successor => {
                self.answer_join(conn, &[me.primary_range], sessions, store)?;
                JoinOutcome::Replaced {
                    previous: self.replace_successor(link),
                }
            }
            PeerRelation::Both => {
                // One combined response: the joiner sent a single leg on this socket.
                self.answer_join(conn, &[me.backup_range, me.primary_range], sessions, store)?;
                let previous = self.replace_successor(link);
                self.predecessor = Some(link);
                JoinOutcome::Replaced { previous }
            }
        };
        Ok(outcome)
    }

    fn answer_join<S: UserStore>(
        &self,
        conn: ConnId,
        ranges: &[KeyRange],
        sessions: &SessionRegistry,
        store: &S,
    ) -> Result<()> {
        let mut users = BTreeMap::new();
        for range in ranges {
            for record in store.list_in_range(*range)? {
                users.insert(record.name.clone(), record);
            }
        }
        let users: Vec<UserRecord> = users.into_values().collect();
        info!("P2P: handing over {} users on conn {}", users.len(), conn);
        sessions.send(conn, &StreamMessage::JoinResponse { users })
    }

    fn replace_successor(&mut self, link: PeerLink) -> Option<ConnId> {
        let previous = self.successor.replace(link)?.conn;
        let shared_with_predecessor = self.predecessor.map(|p| p.conn) == Some(previous);
        (previous != link.conn && !shared_with_predecessor).then_some(previous)
    }

    /// Stores migrated records. Returns true when the caller should stop
    /// processing this connection for the current tick.
    pub fn on_join_response<S: UserStore>(
        &mut self,
        conn: ConnId,
        users: Vec<UserRecord>,
        store: &mut S,
    ) -> bool {
        info!("P2P: received {} users on conn {}", users.len(), conn);
        for record in &users {
            if let Err(e) = store.save(record) {
                warn!("P2P: cannot store migrated user {}: {}", record.name, e);
            }
        }
        self.join_responses += 1;

        let distinct = match (self.predecessor, self.successor) {
            (Some(p), Some(s)) => p.conn != s.conn,
            _ => false,
        };
        distinct && self.predecessor.map(|p| p.conn) == Some(conn)
    }

    pub fn on_backup_request<S: UserStore>(
        &mut self,
        conn: ConnId,
        record: UserRecord,
        sessions: &SessionRegistry,
        store: &mut S,
    ) -> Result<()> {
        let status = match store.save(&record) {
            Ok(()) => {
                debug!("P2P: backed up {} from conn {}", record.name, conn);
                BACKUP_OK
            }
            Err(e) => {
                warn!("P2P: backup of {} failed: {}", record.name, e);
                BACKUP_FAILED
            }
        };
        sessions.send(conn, &StreamMessage::BackupResponse { status })
    }

    pub fn on_backup_response(&self, conn: ConnId, status: u8) {
        if status != BACKUP_OK {
            warn!("P2P: successor on conn {} failed to back up (status {})", conn, status);
        }
    }

    /// Copies a freshly saved record to the successor, best effort.
    pub fn replicate(&self, record: &UserRecord, sessions: &SessionRegistry) {
        let Some(link) = self.successor else {
            return;
        };
        if let Err(e) = sessions.send(link.conn, &StreamMessage::BackupRequest(record.clone())) {
            warn!("P2P: cannot back up {} to {}: {}", record.name, link.ring_id, e);
        }
    }

    pub fn on_disconnect(&mut self, conn: ConnId) {
        let neighbour = [self.predecessor, self.successor]
            .iter()
            .flatten()
            .any(|link| link.conn == conn);
        if neighbour && matches!(self.state, RingState::SendJoin | RingState::AwaitJoinResponses) {
            warn!(
                "P2P: conn {} dropped during the join handshake, abandoning it after {} of {} responses",
                conn, self.join_responses, self.join_legs
            );
            self.join_responses = 0;
            self.join_legs = 0;
            self.set_state(RingState::Active);
        }
        if self.predecessor.map(|p| p.conn) == Some(conn) {
            info!("P2P: lost predecessor {:?}", self.predecessor.map(|p| p.ring_id));
            self.predecessor = None;
        }
        if self.successor.map(|s| s.conn) == Some(conn) {
            info!("P2P: lost successor {:?}", self.successor.map(|s| s.ring_id));
            self.successor = None;
            self.set_state(RingState::FindNewSuccessor);
        }
    }
}
