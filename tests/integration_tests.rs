//! Integration tests for networked components
//!
//! These tests run real sockets on localhost: stream framing against a live
//! area server, the UDP retry budget, duplicate suppression, tracker lookups
//! and a scripted client playing a full session.

use client::console::{ConsoleEvent, RecordingConsole};
use client::network::{Client, ClientConfig};
use server::network::{Server, ServerConfig};
use shared::datagram::{Datagram, UdpMessage};
use shared::reliable::{Mode, MAX_SEND_ATTEMPTS};
use shared::ring::ServerEntry;
use shared::stream::{StreamBuffer, StreamKind, StreamMessage};
use shared::udp_engine::{DatagramHandler, Flow, Outbox, UdpEngine};
use shared::user_store::{FileUserStore, UserStore};
use shared::world::Direction;
use shared::{Error, Result, UserRecord, PROTOCOL_VERSION};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracker::directory::Directory;
use tracker::network::Tracker;

const WAIT: Duration = Duration::from_secs(5);

struct RunningServer {
    dir: TempDir,
    tcp: SocketAddr,
    udp: SocketAddr,
    handle: JoinHandle<Result<()>>,
}

impl RunningServer {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            ip: Ipv4Addr::LOCALHOST,
            tcp_port: 0,
            udp_port: 0,
            roster: dir.path().join("peers.lst"),
            users_dir: dir.path().join("users"),
        };
        let mut server = Server::bind(config).await.unwrap();
        let tcp = local(server.tcp_addr().unwrap());
        let udp = local(server.udp_addr().unwrap());
        let handle = tokio::spawn(async move { server.run().await });
        Self {
            dir,
            tcp,
            udp,
            handle,
        }
    }

    fn stored(&self, name: &str) -> Option<UserRecord> {
        FileUserStore::open(self.dir.path().join("users"))
            .unwrap()
            .load(name)
            .unwrap()
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Servers bind every interface; tests reach them on loopback.
fn local(addr: SocketAddr) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()))
}

/// A raw TCP player speaking the stream protocol directly
struct Peer {
    stream: TcpStream,
    buffer: StreamBuffer,
}

impl Peer {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buffer: StreamBuffer::new(),
        }
    }

    async fn send(&mut self, message: &StreamMessage) {
        self.stream
            .write_all(&message.encode().unwrap())
            .await
            .unwrap();
    }

    async fn next(&mut self) -> StreamMessage {
        timeout(WAIT, async {
            loop {
                if let Some(message) = self.buffer.next_message().unwrap() {
                    return message;
                }
                let mut chunk = [0u8; 512];
                let len = self.stream.read(&mut chunk).await.unwrap();
                assert!(len > 0, "server closed the connection");
                self.buffer.extend(&chunk[..len]);
            }
        })
        .await
        .expect("no message from server")
    }

    /// Skips messages until one matches.
    async fn expect(&mut self, wanted: impl Fn(&StreamMessage) -> bool) -> StreamMessage {
        loop {
            let message = self.next().await;
            if wanted(&message) {
                return message;
            }
        }
    }

    async fn closed(&mut self) -> bool {
        let mut chunk = [0u8; 512];
        matches!(
            timeout(WAIT, self.stream.read(&mut chunk)).await,
            Ok(Ok(0)) | Ok(Err(_))
        )
    }
}

fn login(name: &str, x: u8, y: u8) -> StreamMessage {
    StreamMessage::LoginRequest(UserRecord::new(name, 100, 0, x, y))
}

/// FRAMING TESTS
mod framing_tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_split_across_writes() {
        let server = RunningServer::start().await;
        let mut peer = Peer::connect(server.tcp).await;

        let frame = login("alice", 10, 20).encode().unwrap();
        let (head, tail) = frame.split_at(3);
        peer.stream.write_all(head).await.unwrap();
        peer.stream.flush().await.unwrap();
        sleep(Duration::from_millis(50)).await;
        peer.stream.write_all(tail).await.unwrap();

        assert_eq!(
            peer.next().await,
            StreamMessage::LoginReply {
                error_code: 0,
                hp: 100,
                exp: 0,
                x: 10,
                y: 20
            }
        );
        assert!(matches!(peer.next().await, StreamMessage::MoveNotify(r) if r.name == "alice"));
    }

    #[tokio::test]
    async fn test_back_to_back_frames_in_one_write() {
        let server = RunningServer::start().await;
        let mut peer = Peer::connect(server.tcp).await;

        let mut bytes = login("alice", 10, 20).encode().unwrap();
        bytes.extend(
            StreamMessage::Speak {
                text: "hello there".into(),
            }
            .encode()
            .unwrap(),
        );
        peer.stream.write_all(&bytes).await.unwrap();

        let said = peer
            .expect(|m| matches!(m, StreamMessage::SpeakNotify { .. }))
            .await;
        assert_eq!(
            said,
            StreamMessage::SpeakNotify {
                speaker: "alice".into(),
                text: "hello there".into()
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_only_its_connection() {
        let server = RunningServer::start().await;
        let mut alice = Peer::connect(server.tcp).await;
        let mut mallory = Peer::connect(server.tcp).await;

        alice.send(&login("alice", 10, 10)).await;
        alice.expect(|m| matches!(m, StreamMessage::MoveNotify(_))).await;

        let mut bad = login("mallory", 11, 10).encode().unwrap();
        bad[0] = bad[0].wrapping_add(1);
        mallory.stream.write_all(&bad).await.unwrap();
        assert!(mallory.closed().await);

        alice
            .send(&StreamMessage::Move {
                direction: Direction::North,
            })
            .await;
        let moved = alice
            .expect(|m| matches!(m, StreamMessage::MoveNotify(_)))
            .await;
        assert!(matches!(moved, StreamMessage::MoveNotify(r) if r.name == "alice"));
    }

    #[tokio::test]
    async fn test_unaligned_login_closes_only_its_connection() {
        let server = RunningServer::start().await;
        let mut alice = Peer::connect(server.tcp).await;
        let mut mallory = Peer::connect(server.tcp).await;

        alice.send(&login("alice", 10, 10)).await;
        alice.expect(|m| matches!(m, StreamMessage::MoveNotify(_))).await;

        // 14 bytes is not a multiple of 4
        let mut unaligned = vec![PROTOCOL_VERSION, 0x00, 0x0e, StreamKind::LoginRequest as u8];
        unaligned.extend_from_slice(b"mallory\0\0\0");
        assert_eq!(unaligned.len(), 14);
        mallory.stream.write_all(&unaligned).await.unwrap();
        assert!(mallory.closed().await);

        alice
            .send(&StreamMessage::Move {
                direction: Direction::East,
            })
            .await;
        let moved = alice
            .expect(|m| matches!(m, StreamMessage::MoveNotify(_)))
            .await;
        assert!(matches!(moved, StreamMessage::MoveNotify(r) if r.name == "alice" && r.x == 13));

        alice
            .send(&StreamMessage::Speak {
                text: "still here".into(),
            })
            .await;
        let said = alice
            .expect(|m| matches!(m, StreamMessage::SpeakNotify { .. }))
            .await;
        assert_eq!(
            said,
            StreamMessage::SpeakNotify {
                speaker: "alice".into(),
                text: "still here".into()
            }
        );
    }

    #[tokio::test]
    async fn test_commands_before_login_are_refused() {
        let server = RunningServer::start().await;
        let mut peer = Peer::connect(server.tcp).await;

        peer.send(&StreamMessage::Logout).await;
        assert_eq!(
            peer.next().await,
            StreamMessage::InvalidState { error_code: 0 }
        );

        peer.send(&login("alice", 1, 1)).await;
        peer.expect(|m| matches!(m, StreamMessage::MoveNotify(_))).await;
        peer.send(&login("alice", 1, 1)).await;
        assert_eq!(
            peer.next().await,
            StreamMessage::InvalidState { error_code: 1 }
        );
    }
}

/// UDP RELIABILITY TESTS
mod udp_tests {
    use super::*;

    #[derive(Default)]
    struct Attempts {
        seen: Vec<u32>,
    }

    impl DatagramHandler for Attempts {
        fn handle(&mut self, _datagram: &Datagram, _outbox: &mut Outbox) -> Result<Flow> {
            Ok(Flow::Stop)
        }

        fn on_attempt(&mut self, attempt: u32) {
            self.seen.push(attempt);
        }
    }

    #[tokio::test]
    async fn test_retry_budget_against_silent_peer() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut engine = UdpEngine::bind("127.0.0.1:0".parse().unwrap(), Mode::Resend)
            .await
            .unwrap();
        let request = UdpMessage::StorageLocationRequest {
            name: "alice".into(),
        };

        let started = Instant::now();
        engine
            .send(silent.local_addr().unwrap(), 77, &request)
            .await
            .unwrap();
        let mut handler = Attempts::default();
        let result = timeout(WAIT, engine.run(&mut handler)).await.unwrap();
        let elapsed = started.elapsed();

        assert!(matches!(
            result,
            Err(Error::RetriesExhausted { attempts }) if attempts == MAX_SEND_ATTEMPTS
        ));
        assert_eq!(handler.seen, vec![1, 2, 3, 4]);
        // 100 + 200 + 400 + 800 ms of backoff
        assert!(elapsed >= Duration::from_millis(1500), "gave up after {:?}", elapsed);

        let mut received = 0;
        let mut buffer = [0u8; 64];
        while let Ok((len, _)) = silent.try_recv_from(&mut buffer) {
            let datagram = Datagram::parse(&buffer[..len], engine.local_addr().unwrap()).unwrap();
            assert_eq!(datagram.sequence_id, 77);
            received += 1;
        }
        assert_eq!(received, MAX_SEND_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_receiver_drops_repeats() {
        let mut engine = UdpEngine::bind("127.0.0.1:0".parse().unwrap(), Mode::NoResend)
            .await
            .unwrap();
        let target = engine.local_addr().unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let request = UdpMessage::ServerAreaRequest { x: 3, y: 4 };

        let packet = request.encode(5).unwrap();
        sender.send_to(&packet, target).await.unwrap();
        sender.send_to(&packet, target).await.unwrap();
        sender
            .send_to(&request.encode(6).unwrap(), target)
            .await
            .unwrap();

        let first = timeout(WAIT, engine.recv()).await.unwrap().unwrap();
        assert_eq!(first.map(|d| d.sequence_id), Some(5));
        let repeat = timeout(WAIT, engine.recv()).await.unwrap().unwrap();
        assert!(repeat.is_none());
        let next = timeout(WAIT, engine.recv()).await.unwrap().unwrap();
        assert_eq!(next.map(|d| d.sequence_id), Some(6));
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let mut engine = UdpEngine::bind("127.0.0.1:0".parse().unwrap(), Mode::NoResend)
            .await
            .unwrap();
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&[1, 2, 3], engine.local_addr().unwrap())
            .await
            .unwrap();

        let received = timeout(WAIT, engine.recv()).await.unwrap().unwrap();
        assert!(received.is_none());
    }
}

/// LOOKUP TESTS
mod lookup_tests {
    use super::*;

    struct Capture {
        reply: Option<UdpMessage>,
    }

    impl DatagramHandler for Capture {
        fn handle(&mut self, datagram: &Datagram, _outbox: &mut Outbox) -> Result<Flow> {
            self.reply = Some(datagram.message()?);
            Ok(Flow::Stop)
        }
    }

    async fn ask(engine: &mut UdpEngine, to: SocketAddr, sequence_id: u32, request: UdpMessage) -> UdpMessage {
        engine.send(to, sequence_id, &request).await.unwrap();
        let mut capture = Capture { reply: None };
        timeout(WAIT, engine.run(&mut capture))
            .await
            .unwrap()
            .unwrap();
        capture.reply.unwrap()
    }

    #[tokio::test]
    async fn test_tracker_and_storage_lookups() {
        let server = RunningServer::start().await;
        let directory = Directory::from_servers(vec![ServerEntry::for_address(
            Ipv4Addr::LOCALHOST,
            server.tcp.port(),
            Some(server.udp.port()),
        )]);
        let mut tracker = Tracker::bind("127.0.0.1:0".parse().unwrap(), directory)
            .await
            .unwrap();
        let tracker_addr = tracker.local_addr().unwrap();
        let tracker_task = tokio::spawn(async move { tracker.run().await });

        let mut engine = UdpEngine::bind("127.0.0.1:0".parse().unwrap(), Mode::Resend)
            .await
            .unwrap();

        let location = ask(
            &mut engine,
            tracker_addr,
            1,
            UdpMessage::StorageLocationRequest {
                name: "alice".into(),
            },
        )
        .await;
        assert_eq!(
            location,
            UdpMessage::StorageLocationResponse {
                ip: Ipv4Addr::LOCALHOST,
                udp_port: server.udp.port()
            }
        );

        let state = ask(
            &mut engine,
            server.udp,
            2,
            UdpMessage::PlayerStateRequest {
                name: "alice".into(),
            },
        )
        .await;
        let UdpMessage::PlayerStateResponse(mut record) = state else {
            panic!("unexpected reply {:?}", state);
        };
        assert_eq!(record.name, "alice");
        assert_eq!(record.exp, 0);

        record.exp = 9;
        let saved = ask(&mut engine, server.udp, 3, UdpMessage::SaveStateRequest(record.clone())).await;
        assert_eq!(saved, UdpMessage::SaveStateResponse { error_code: 0 });
        assert_eq!(server.stored("alice"), Some(record));

        let area = ask(&mut engine, tracker_addr, 4, UdpMessage::ServerAreaRequest { x: 50, y: 50 }).await;
        assert!(matches!(
            area,
            UdpMessage::ServerAreaResponse { tcp_port, .. } if tcp_port == server.tcp.port()
        ));

        tracker_task.abort();
    }
}

/// CLIENT SESSION TESTS
mod client_tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_client_plays_and_saves() {
        let server = RunningServer::start().await;
        let directory = Directory::from_servers(vec![ServerEntry::for_address(
            Ipv4Addr::LOCALHOST,
            server.tcp.port(),
            Some(server.udp.port()),
        )]);
        let mut tracker = Tracker::bind("127.0.0.1:0".parse().unwrap(), directory)
            .await
            .unwrap();
        let config = ClientConfig {
            tracker: tracker.local_addr().unwrap(),
            autosave: Duration::from_secs(600),
        };
        let tracker_task = tokio::spawn(async move { tracker.run().await });

        // bob watches alice through the broadcasts
        let mut bob = Peer::connect(server.tcp).await;
        bob.send(&login("bob", 0, 0)).await;
        bob.expect(|m| matches!(m, StreamMessage::MoveNotify(r) if r.name == "bob"))
            .await;

        let (mut keyboard, input) = tokio::io::duplex(1024);
        let mut client = Client::bind(config, RecordingConsole::new()).await.unwrap();
        let client_task = tokio::spawn(async move {
            let result = client.run(BufReader::new(input)).await;
            (result, client)
        });

        keyboard.write_all(b"login alice\n").await.unwrap();
        let entered = bob
            .expect(|m| matches!(m, StreamMessage::MoveNotify(r) if r.name == "alice"))
            .await;
        let StreamMessage::MoveNotify(entered) = entered else {
            unreachable!();
        };
        sleep(Duration::from_millis(200)).await;

        keyboard.write_all(b"move east\n").await.unwrap();
        let moved = bob
            .expect(|m| matches!(m, StreamMessage::MoveNotify(r) if r.name == "alice"))
            .await;
        let StreamMessage::MoveNotify(moved) = moved else {
            unreachable!();
        };
        assert_eq!(moved.x, (entered.x + 3) % 100);
        assert_eq!(moved.y, entered.y);

        keyboard.write_all(b"logout\n").await.unwrap();
        bob.expect(|m| matches!(m, StreamMessage::LogoutNotify(r) if r.name == "alice"))
            .await;

        let (result, client) = timeout(WAIT, client_task).await.unwrap().unwrap();
        result.unwrap();

        let events = &client.session().console().events;
        assert!(events.contains(&ConsoleEvent::LoginReply { error_code: 0 }));
        assert!(events.contains(&ConsoleEvent::SaveResponse { error_code: 0 }));
        assert_eq!(events.last(), Some(&ConsoleEvent::Disconnected));

        let saved = server.stored("alice").unwrap();
        assert_eq!((saved.x, saved.y), (moved.x, moved.y));

        drop(keyboard);
        tracker_task.abort();
    }

    #[tokio::test]
    async fn test_client_gives_up_without_tracker() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ClientConfig {
            tracker: silent.local_addr().unwrap(),
            autosave: Duration::from_secs(600),
        };
        let (mut keyboard, input) = tokio::io::duplex(64);
        keyboard.write_all(b"login alice\n").await.unwrap();

        let mut client = Client::bind(config, RecordingConsole::new()).await.unwrap();
        let result = timeout(WAIT, client.run(BufReader::new(input))).await.unwrap();

        assert!(matches!(result, Err(Error::RetriesExhausted { .. })));
        let events = &client.session().console().events;
        assert!(events.contains(&ConsoleEvent::UdpAttempt(4)));
        assert_eq!(events.last(), Some(&ConsoleEvent::UdpFailure));
    }
}
