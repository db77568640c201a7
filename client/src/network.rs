//! Client event loop alternating between UDP lookups and a TCP game session

use crate::console::{Console, ConsoleEvent};
use crate::session::{ClientSession, ClientState, StreamFlow};
use log::{debug, info};
use shared::reliable::Mode;
use shared::stream::StreamBuffer;
use shared::udp_engine::{Outbox, UdpEngine};
use shared::{Error, Result, MAX_PACKET_LENGTH};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, Lines};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub const DEFAULT_AUTOSAVE: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub tracker: SocketAddr,
    pub autosave: Duration,
}

pub struct Client<C> {
    udp: UdpEngine,
    session: ClientSession<C>,
    autosave: Duration,
}

impl<C: Console> Client<C> {
    pub async fn bind(config: ClientConfig, console: C) -> Result<Self> {
        let udp = UdpEngine::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)), Mode::Resend).await?;
        info!("Client using tracker {}", config.tracker);
        Ok(Self {
            udp,
            session: ClientSession::new(console, config.tracker),
            autosave: config.autosave,
        })
    }

    pub fn session(&self) -> &ClientSession<C> {
        &self.session
    }

    /// Plays until the player logs out and the final save is acknowledged.
    ///
    /// Errors are fatal: no answer from a lookup, an unreachable area
    /// server, malformed server traffic or closed input.
    pub async fn run<R: AsyncBufRead + Unpin>(&mut self, input: R) -> Result<()> {
        let mut lines = input.lines();

        while self.session.state() == ClientState::NoState {
            self.session.console_mut().prompt();
            match lines.next_line().await? {
                Some(line) => self.session.on_line(&line),
                None => return Err(Error::transport("input closed before login")),
            }
        }

        while self.session.state() != ClientState::GameOver {
            self.lookup().await?;
            if self.session.state() == ClientState::GameOver {
                break;
            }
            let stream = self.connect().await?;
            self.session.begin_login()?;
            self.play(stream, &mut lines).await?;
        }

        self.session.notify(ConsoleEvent::Disconnected);
        Ok(())
    }

    /// One request/response chain over UDP, driven by the session.
    async fn lookup(&mut self) -> Result<()> {
        let mut outbox = Outbox::new();
        self.session.begin_lookup(&mut outbox)?;
        self.udp.flush(&mut outbox).await?;
        match self.udp.run(&mut self.session).await {
            Err(error @ Error::RetriesExhausted { .. }) => {
                self.session.notify(ConsoleEvent::UdpFailure);
                Err(error)
            }
            result => result,
        }
    }

    async fn connect(&mut self) -> Result<TcpStream> {
        let addr = self
            .session
            .area_server()
            .ok_or_else(|| Error::violation("no area server to connect to"))?;
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!("connected to area server {}", addr);
                Ok(stream)
            }
            Err(e) => {
                self.session.notify(ConsoleEvent::ConnectFailure);
                Err(Error::transport(format!("cannot connect to {}: {}", addr, e)))
            }
        }
    }

    /// The TCP phase: commands from `lines`, notifications from the server
    /// and the autosave timer, until the server logs us out.
    async fn play<R: AsyncBufRead + Unpin>(
        &mut self,
        stream: TcpStream,
        lines: &mut Lines<R>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let mut buffer = StreamBuffer::new();
        let mut chunk = [0u8; MAX_PACKET_LENGTH];
        let mut autosave = interval_at(Instant::now() + self.autosave, self.autosave);
        autosave.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.flush_outgoing(&mut writer).await?;
        self.session.console_mut().prompt();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        return Err(Error::transport("input closed"));
                    };
                    self.session.on_line(&line);
                    self.flush_outgoing(&mut writer).await?;
                    self.session.console_mut().prompt();
                }
                read = reader.read(&mut chunk) => {
                    let len = read?;
                    if len == 0 {
                        self.session.on_server_closed();
                        return Ok(());
                    }
                    buffer.extend(&chunk[..len]);
                    if self.drain_buffer(&mut buffer)? == StreamFlow::Detach {
                        return Ok(());
                    }
                }
                _ = autosave.tick() => {
                    if self.session.begin_autosave() {
                        debug!("autosaving");
                        self.lookup().await?;
                        self.session.finish_autosave();
                    }
                }
            }
        }
    }

    fn drain_buffer(&mut self, buffer: &mut StreamBuffer) -> Result<StreamFlow> {
        for message in buffer.messages() {
            let flow = message.and_then(|message| self.session.on_stream_message(message));
            match flow {
                Ok(StreamFlow::Continue) => {}
                Ok(StreamFlow::Detach) => return Ok(StreamFlow::Detach),
                Err(error) => {
                    self.session.notify(ConsoleEvent::MalformedFromServer);
                    return Err(error);
                }
            }
        }
        Ok(StreamFlow::Continue)
    }

    async fn flush_outgoing(&mut self, writer: &mut OwnedWriteHalf) -> Result<()> {
        for message in self.session.take_outgoing() {
            let frame = message.encode()?;
            if let Err(e) = writer.write_all(&frame).await {
                self.session.notify(ConsoleEvent::Disconnected);
                return Err(Error::transport(format!("cannot send {:?}: {}", message.kind(), e)));
            }
        }
        Ok(())
    }
}
