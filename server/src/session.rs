//! Connection and session management for the area server
//!
//! Every TCP socket the server holds, whether accepted from a player or
//! opened to a ring neighbour, is a [`Session`]:
//! - A connection id assigned in accept/connect order, starting at 1
//! - The player logged in on it, if any
//! - A reassembly buffer for partial frames
//! - A [`Link`] to the reader and writer tasks that own the socket halves
//!
//! Reader tasks forward bytes to the event loop as [`ConnectionEvent`]s, so
//! the registry itself is only ever touched from that one loop.

use log::{debug, info, warn};
use shared::stream::{StreamBuffer, StreamMessage};
use shared::{Error, Result, MAX_PACKET_LENGTH};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub type ConnId = u32;

/// Messages sent from connection reader tasks to the event loop
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    Data { conn: ConnId, bytes: Vec<u8> },
    Closed { conn: ConnId },
}

/// Handle to the tasks driving one socket
///
/// Dropping a link stops its reader immediately. The writer finishes
/// sending whatever was queued and then closes the socket.
#[derive(Debug)]
pub struct Link {
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
}

impl Link {
    /// Splits the stream and spawns its reader and writer tasks
    pub fn spawn(
        conn: ConnId,
        stream: TcpStream,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Self {
        let (mut read_half, mut write_half) = stream.into_split();
        let (outgoing, mut queued) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            while let Some(bytes) = queued.recv().await {
                if let Err(e) = write_half.write_all(&bytes).await {
                    debug!("write to connection {} failed: {}", conn, e);
                    break;
                }
            }
        });

        let reader = tokio::spawn(async move {
            let mut buffer = [0u8; MAX_PACKET_LENGTH];
            loop {
                match read_half.read(&mut buffer).await {
                    Ok(0) => break,
                    Ok(len) => {
                        let event = ConnectionEvent::Data {
                            conn,
                            bytes: buffer[..len].to_vec(),
                        };
                        if events.send(event).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!("read from connection {} failed: {}", conn, e);
                        break;
                    }
                }
            }
            let _ = events.send(ConnectionEvent::Closed { conn });
        });

        Self {
            outgoing,
            reader: Some(reader),
        }
    }

    /// A link with no socket behind it; frames go to `outgoing`
    pub fn detached(outgoing: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self {
            outgoing,
            reader: None,
        }
    }

    pub fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.outgoing
            .send(frame)
            .map_err(|_| Error::transport("connection writer has stopped"))
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Per-socket state
#[derive(Debug)]
pub struct Session {
    pub id: ConnId,
    pub peer_addr: SocketAddr,
    /// Name of the player logged in on this connection
    pub player: Option<String>,
    pub buffer: StreamBuffer,
    link: Link,
}

impl Session {
    pub fn is_logged_in(&self) -> bool {
        self.player.is_some()
    }

    pub fn send(&self, message: &StreamMessage) -> Result<()> {
        self.link.send(message.encode()?)
    }
}

/// All open sessions of one server
///
/// Sessions are kept in connection id order, which is also the order
/// broadcasts go out in.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: BTreeMap<ConnId, Session>,
    next_id: ConnId,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    /// Creates an empty registry; connection ids start from 1
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Adds a session whose link is built for the freshly assigned id
    pub fn register(
        &mut self,
        peer_addr: SocketAddr,
        make_link: impl FnOnce(ConnId) -> Link,
    ) -> ConnId {
        let id = self.next_id;
        self.next_id += 1;

        let session = Session {
            id,
            peer_addr,
            player: None,
            buffer: StreamBuffer::new(),
            link: make_link(id),
        };
        self.sessions.insert(id, session);
        id
    }

    /// Registers an accepted socket
    pub fn accept(
        &mut self,
        stream: TcpStream,
        peer_addr: SocketAddr,
        events: &mpsc::UnboundedSender<ConnectionEvent>,
    ) -> ConnId {
        let conn = self.register(peer_addr, |id| Link::spawn(id, stream, events.clone()));
        info!("New connection from {}. conn={}", peer_addr, conn);
        conn
    }

    /// Opens a connection to another server and registers it
    pub async fn connect(
        &mut self,
        addr: SocketAddr,
        events: &mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<ConnId> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::transport(format!("cannot connect to {}: {}", addr, e)))?;
        let conn = self.register(addr, |id| Link::spawn(id, stream, events.clone()));
        debug!("connected to {} as conn {}", addr, conn);
        Ok(conn)
    }

    pub fn lookup(&self, conn: ConnId) -> Option<&Session> {
        self.sessions.get(&conn)
    }

    pub fn lookup_mut(&mut self, conn: ConnId) -> Option<&mut Session> {
        self.sessions.get_mut(&conn)
    }

    /// Removes a session; its link and any partial frame go with it
    pub fn remove(&mut self, conn: ConnId) -> Option<Session> {
        let session = self.sessions.remove(&conn)?;
        if !session.buffer.is_empty() {
            debug!(
                "discarding {} buffered bytes of conn {}",
                session.buffer.len(),
                conn
            );
        }
        Some(session)
    }

    pub fn contains(&self, conn: ConnId) -> bool {
        self.sessions.contains_key(&conn)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn send(&self, conn: ConnId, message: &StreamMessage) -> Result<()> {
        let session = self
            .sessions
            .get(&conn)
            .ok_or_else(|| Error::transport(format!("no connection {}", conn)))?;
        debug!("conn {} sending {:?}", conn, message.kind());
        session.send(message)
    }

    /// Sends to every session with a logged in player
    ///
    /// A session whose writer is gone is skipped; its reader will report the
    /// close shortly.
    pub fn broadcast(&self, message: &StreamMessage) -> Result<()> {
        let frame = message.encode()?;
        for session in self.sessions.values().filter(|s| s.is_logged_in()) {
            if let Err(e) = session.link.send(frame.clone()) {
                warn!("broadcast to conn {} failed: {}", session.id, e);
            }
        }
        Ok(())
    }

    pub fn find_by_player(&self, name: &str) -> Option<ConnId> {
        self.sessions
            .values()
            .find(|session| session.player.as_deref() == Some(name))
            .map(|session| session.id)
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.sessions.keys().copied().collect()
    }
}
