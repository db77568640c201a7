//! Socket driver around [`ReliabilityState`].
//!
//! The engine owns one UDP socket. Requesting roles (`Mode::Resend`) get
//! retransmission with exponential backoff and a fatal error after the
//! fourth unanswered attempt; answering roles (`Mode::NoResend`) only
//! validate and deduplicate.

use crate::datagram::{Datagram, UdpMessage};
use crate::reliable::{Anomaly, Inbound, Mode, ReliabilityState};
use crate::{Error, Result};
use log::{debug, info, warn};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
const RECV_BUFFER_SIZE: usize = 4096;

/// What the receive loop should do after a datagram has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Replies queued by a handler, sent by the engine once the handler returns.
#[derive(Debug, Default)]
pub struct Outbox {
    queued: Vec<(SocketAddr, u32, UdpMessage)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn send(&mut self, destination: SocketAddr, sequence_id: u32, message: UdpMessage) {
        self.queued.push((destination, sequence_id, message));
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (SocketAddr, u32, UdpMessage)> + '_ {
        self.queued.drain(..)
    }
}

/// Consumer of validated, deduplicated datagrams.
pub trait DatagramHandler {
    fn handle(&mut self, datagram: &Datagram, outbox: &mut Outbox) -> Result<Flow>;

    /// Called after every transmission of an outstanding request.
    fn on_attempt(&mut self, _attempt: u32) {}
}

pub struct UdpEngine {
    socket: UdpSocket,
    state: ReliabilityState,
}

impl UdpEngine {
    pub async fn bind(addr: SocketAddr, mode: Mode) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        debug!("UDP engine bound to {} in {:?} mode", socket.local_addr()?, mode);
        Ok(Self::from_socket(socket, mode))
    }

    pub fn from_socket(socket: UdpSocket, mode: Mode) -> Self {
        Self {
            socket,
            state: ReliabilityState::new(mode),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn mode(&self) -> Mode {
        self.state.mode()
    }

    pub fn is_awaiting(&self) -> bool {
        self.state.is_awaiting()
    }

    /// Sends one message. In resend mode it becomes the outstanding request.
    pub async fn send(&mut self, destination: SocketAddr, sequence_id: u32, message: &UdpMessage) -> Result<()> {
        let packet = message.encode(sequence_id)?;
        self.transmit(destination, &packet).await?;
        debug!(
            "sent UDP packet #{} {:?} to {}",
            sequence_id,
            message.kind(),
            destination
        );
        self.state
            .record_send(destination, sequence_id, packet, Instant::now());
        Ok(())
    }

    pub async fn flush(&mut self, outbox: &mut Outbox) -> Result<()> {
        let queued: Vec<_> = outbox.drain().collect();
        for (destination, sequence_id, message) in queued {
            self.send(destination, sequence_id, &message).await?;
        }
        Ok(())
    }

    async fn transmit(&self, destination: SocketAddr, packet: &[u8]) -> Result<()> {
        let sent = self.socket.send_to(packet, destination).await?;
        if sent != packet.len() {
            return Err(Error::transport(format!(
                "short UDP send to {}: {} of {} bytes",
                destination,
                sent,
                packet.len()
            )));
        }
        Ok(())
    }

    /// Waits for the next datagram worth handling.
    ///
    /// Malformed packets and duplicates yield `Ok(None)`. Only a failing
    /// socket is an error. The await point is the socket read, so the
    /// future can be dropped inside `select!` without losing a packet.
    pub async fn recv(&mut self) -> Result<Option<Datagram>> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        let (len, source) = self.socket.recv_from(&mut buffer).await?;

        let datagram = match Datagram::parse(&buffer[..len], source) {
            Ok(datagram) => datagram,
            Err(err) => {
                warn!("Received malformed UDP packet: {}", err);
                return Ok(None);
            }
        };

        match self.state.on_receive(source, datagram.sequence_id) {
            Inbound::Duplicate => {
                if self.state.mode() == Mode::Resend {
                    info!(
                        "Received duplicate packet #{} from {}",
                        datagram.sequence_id, source
                    );
                } else {
                    debug!("dropping duplicate #{} from {}", datagram.sequence_id, source);
                }
                Ok(None)
            }
            Inbound::Fresh { anomalies } => {
                for anomaly in anomalies {
                    match anomaly {
                        Anomaly::SequenceMismatch { expected, received } => warn!(
                            "Received malformed UDP packet: sequence {} while awaiting {}",
                            received, expected
                        ),
                        Anomaly::UnexpectedSource { expected, received } => warn!(
                            "Received UDP packet from unexpected source {} (expected {})",
                            received, expected
                        ),
                    }
                }
                debug!(
                    "received UDP packet #{} {:?} from {}",
                    datagram.sequence_id, datagram.kind, source
                );
                Ok(Some(datagram))
            }
        }
    }

    /// Retransmits the outstanding request if its backoff has elapsed and
    /// returns the attempt number that went out.
    pub async fn retransmit_due(&mut self) -> Result<Option<u32>> {
        let Some((destination, packet)) = self.state.poll(Instant::now())? else {
            return Ok(None);
        };
        self.transmit(destination, &packet).await?;
        let attempt = self
            .state
            .outstanding()
            .map(|request| request.attempts)
            .unwrap_or_default();
        info!("UDP transmission attempt {} to {}", attempt, destination);
        Ok(Some(attempt))
    }

    /// Receive loop: runs until the handler says `Flow::Stop`.
    ///
    /// Handler errors and transport failures end the loop with an error.
    pub async fn run<H: DatagramHandler + ?Sized>(&mut self, handler: &mut H) -> Result<()> {
        if let Some(request) = self.state.outstanding() {
            handler.on_attempt(request.attempts);
        }
        loop {
            if let Ok(received) = timeout(POLL_INTERVAL, self.recv()).await {
                if let Some(datagram) = received? {
                    let mut outbox = Outbox::new();
                    let flow = handler.handle(&datagram, &mut outbox)?;
                    self.flush(&mut outbox).await?;
                    if flow == Flow::Stop {
                        return Ok(());
                    }
                }
            }
            if let Some(attempt) = self.retransmit_due().await? {
                handler.on_attempt(attempt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::UserRecord;

    struct Echo {
        seen: Vec<u32>,
        stop_after: usize,
    }

    impl DatagramHandler for Echo {
        fn handle(&mut self, datagram: &Datagram, outbox: &mut Outbox) -> Result<Flow> {
            self.seen.push(datagram.sequence_id);
            if let UdpMessage::PlayerStateRequest { name } = datagram.message()? {
                outbox.send(
                    datagram.source,
                    datagram.sequence_id,
                    UdpMessage::PlayerStateResponse(UserRecord::new(name, 100, 0, 5, 5)),
                );
            }
            if self.seen.len() >= self.stop_after {
                Ok(Flow::Stop)
            } else {
                Ok(Flow::Continue)
            }
        }
    }

    struct Collect(Vec<UdpMessage>);

    impl DatagramHandler for Collect {
        fn handle(&mut self, datagram: &Datagram, _outbox: &mut Outbox) -> Result<Flow> {
            self.0.push(datagram.message()?);
            Ok(Flow::Stop)
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_request_and_reply() {
        let mut server = UdpEngine::bind(loopback(), Mode::NoResend).await.unwrap();
        let mut client = UdpEngine::bind(loopback(), Mode::Resend).await.unwrap();
        let server_addr = server.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let mut echo = Echo {
                seen: vec![],
                stop_after: 1,
            };
            server.run(&mut echo).await.unwrap();
            echo.seen
        });

        client
            .send(
                server_addr,
                42,
                &UdpMessage::PlayerStateRequest {
                    name: "alice".into(),
                },
            )
            .await
            .unwrap();
        assert!(client.is_awaiting());

        let mut collect = Collect(vec![]);
        client.run(&mut collect).await.unwrap();

        assert!(!client.is_awaiting());
        assert_eq!(
            collect.0,
            vec![UdpMessage::PlayerStateResponse(UserRecord::new(
                "alice", 100, 0, 5, 5
            ))]
        );
        assert_eq!(server_task.await.unwrap(), vec![42]);
    }

    #[tokio::test]
    async fn test_malformed_packet_is_dropped() {
        let mut engine = UdpEngine::bind(loopback(), Mode::NoResend).await.unwrap();
        let addr = engine.local_addr().unwrap();
        let raw = UdpSocket::bind(loopback()).await.unwrap();

        raw.send_to(&[0, 0, 0, 0, 1, 0], addr).await.unwrap();
        assert!(engine.recv().await.unwrap().is_none());

        let good = UdpMessage::ServerAreaRequest { x: 1, y: 2 }.encode(9).unwrap();
        raw.send_to(&good, addr).await.unwrap();
        let datagram = engine.recv().await.unwrap().unwrap();
        assert_eq!(datagram.sequence_id, 9);
    }
}
