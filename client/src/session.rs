//! Client game state machine
//!
//! ```text
//! NoState -> Finding -> Grabbing -> NotLoggedIn -> LoggedIn
//! LoggedIn -> Switching -> NotLoggedIn -> LoggedIn -> ...
//! LoggedIn -> LoggingOut -> Finding -> Saving -> GameOver
//! ```
//!
//! The UDP side looks up where the player is stored and which server owns
//! the player's area; the TCP side plays on that server. [`ClientSession`]
//! holds no sockets: UDP replies go through an [`Outbox`] and TCP messages
//! are queued for the event loop to write.

use crate::console::{Console, ConsoleEvent};
use crate::input::{parse_command, Command};
use log::debug;
use rand::Rng;
use shared::datagram::{Datagram, UdpMessage};
use shared::stream::StreamMessage;
use shared::udp_engine::{DatagramHandler, Flow, Outbox};
use shared::world::{render_map, Area};
use shared::{Error, Result, UserRecord};
use std::collections::BTreeMap;
use std::mem;
use std::net::{SocketAddr, SocketAddrV4};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    NoState,
    Finding,
    Grabbing,
    NotLoggedIn,
    LoggedIn,
    LoggingOut,
    Switching,
    Saving,
    GameOver,
}

/// What the event loop does with the TCP connection after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFlow {
    Continue,
    /// We are logged out of this server; close the socket and go back to UDP.
    Detach,
}

pub struct ClientSession<C> {
    console: C,
    state: ClientState,
    name: String,
    me: Option<UserRecord>,
    /// Other players on the current server, by name
    others: BTreeMap<String, UserRecord>,
    area: Area,
    tracker: SocketAddr,
    storage: Option<SocketAddr>,
    area_server: Option<SocketAddr>,
    sequence_id: u32,
    logging_out: bool,
    autosave: bool,
    autosave_done: bool,
    first_login: bool,
    outgoing: Vec<StreamMessage>,
}

impl<C: Console> ClientSession<C> {
    pub fn new(console: C, tracker: SocketAddr) -> Self {
        Self::with_sequence(console, tracker, rand::thread_rng().gen())
    }

    /// Starts numbering requests after `sequence_id`
    pub fn with_sequence(console: C, tracker: SocketAddr, sequence_id: u32) -> Self {
        debug!("initial sequence id {}", sequence_id);
        Self {
            console,
            state: ClientState::NoState,
            name: String::new(),
            me: None,
            others: BTreeMap::new(),
            area: Area::WHOLE,
            tracker,
            storage: None,
            area_server: None,
            sequence_id,
            logging_out: false,
            autosave: false,
            autosave_done: false,
            first_login: true,
            outgoing: Vec::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn me(&self) -> Option<&UserRecord> {
        self.me.as_ref()
    }

    pub fn area(&self) -> Area {
        self.area
    }

    pub fn area_server(&self) -> Option<SocketAddr> {
        self.area_server
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn console_mut(&mut self) -> &mut C {
        &mut self.console
    }

    pub fn notify(&mut self, event: ConsoleEvent) {
        self.console.notify(event);
    }

    /// TCP messages produced since the last call, in send order
    pub fn take_outgoing(&mut self) -> Vec<StreamMessage> {
        mem::take(&mut self.outgoing)
    }

    fn next_sequence(&mut self) -> u32 {
        self.sequence_id = self.sequence_id.wrapping_add(1);
        self.sequence_id
    }

    fn request(&mut self, outbox: &mut Outbox, destination: SocketAddr, message: UdpMessage) {
        let sequence_id = self.next_sequence();
        outbox.send(destination, sequence_id, message);
    }

    /// Queues the request that opens the next UDP exchange.
    pub fn begin_lookup(&mut self, outbox: &mut Outbox) -> Result<()> {
        match self.state {
            ClientState::Finding => {
                let name = self.name.clone();
                self.request(outbox, self.tracker, UdpMessage::StorageLocationRequest { name });
            }
            ClientState::NotLoggedIn => {
                let (x, y) = self
                    .me
                    .as_ref()
                    .map(|me| (me.x, me.y))
                    .ok_or_else(|| Error::violation("area lookup before the player state is known"))?;
                self.request(outbox, self.tracker, UdpMessage::ServerAreaRequest { x, y });
            }
            state => return Err(Error::violation(format!("no lookup to start in {:?}", state))),
        }
        Ok(())
    }

    /// Starts a periodic save. Only a player in game is saved.
    pub fn begin_autosave(&mut self) -> bool {
        if self.state != ClientState::LoggedIn {
            return false;
        }
        self.autosave = true;
        self.autosave_done = false;
        self.state = ClientState::Finding;
        true
    }

    pub fn finish_autosave(&mut self) {
        self.autosave = false;
        self.autosave_done = false;
        self.state = ClientState::LoggedIn;
    }

    /// The area server hung up on us.
    pub fn on_server_closed(&mut self) {
        debug!("server {:?} closed the connection", self.area_server);
        self.state = ClientState::GameOver;
    }

    /// The login request for the server we just connected to.
    pub fn begin_login(&mut self) -> Result<()> {
        let me = self
            .me
            .clone()
            .ok_or_else(|| Error::violation("login before the player state is known"))?;
        self.outgoing.push(StreamMessage::LoginRequest(me));
        Ok(())
    }

    /// Handles one line typed at the prompt.
    pub fn on_line(&mut self, line: &str) {
        match parse_command(line) {
            Ok(command) => self.on_command(command),
            Err(error) => self.notify(ConsoleEvent::InvalidInput(error)),
        }
    }

    pub fn on_command(&mut self, command: Command) {
        if self.state == ClientState::NoState {
            match command {
                Command::Login(name) => {
                    self.name = name;
                    self.state = ClientState::Finding;
                }
                _ => self.notify(ConsoleEvent::BeforeLogin),
            }
            return;
        }

        let in_game = matches!(
            command,
            Command::Move(_) | Command::Attack(_) | Command::Speak(_) | Command::Logout
        );
        if in_game && self.state != ClientState::LoggedIn {
            debug!("{:?} ignored while {:?}", command, self.state);
            self.notify(ConsoleEvent::InvalidState { error_code: 0 });
            return;
        }

        match command {
            Command::Logout => {
                self.outgoing.push(StreamMessage::Logout);
                self.state = ClientState::LoggingOut;
                self.logging_out = true;
            }
            Command::Speak(text) => self.outgoing.push(StreamMessage::Speak { text }),
            Command::Map => {
                let occupied = self
                    .me
                    .iter()
                    .chain(self.others.values())
                    .map(UserRecord::location);
                let map = render_map(occupied);
                self.notify(ConsoleEvent::Map(map));
            }
            Command::Login(_) => {
                if let Some(me) = self.me.clone() {
                    self.outgoing.push(StreamMessage::LoginRequest(me));
                }
            }
            Command::Move(direction) => {
                let Some(me) = self.me.as_mut() else {
                    return;
                };
                let next = me.location().step(direction);
                if self.area.contains(next) {
                    self.outgoing.push(StreamMessage::Move { direction });
                } else {
                    debug!("leaving area {} towards ({}, {})", self.area, next.x, next.y);
                    me.set_location(next);
                    self.outgoing.push(StreamMessage::Logout);
                    self.state = ClientState::Switching;
                }
            }
            Command::Attack(victim) => {
                let Some(me) = self.me.as_ref() else {
                    return;
                };
                if victim == me.name {
                    return;
                }
                let visible = self
                    .others
                    .get(&victim)
                    .is_some_and(|other| self.area.in_vision(me.location(), other.location()));
                if visible {
                    self.outgoing.push(StreamMessage::Attack { victim });
                } else {
                    self.notify(ConsoleEvent::NotVisible);
                }
            }
        }
    }

    fn sees(&self, other: &UserRecord) -> bool {
        match &self.me {
            Some(me) if me.name == other.name => true,
            Some(me) => self.area.in_vision(me.location(), other.location()),
            None => false,
        }
    }

    fn player_mut(&mut self, name: &str) -> Option<&mut UserRecord> {
        match self.me.as_mut() {
            Some(me) if me.name == name => Some(me),
            _ => self.others.get_mut(name),
        }
    }

    fn visible_others(&self) -> Vec<String> {
        self.others
            .values()
            .filter(|other| self.sees(other))
            .map(|other| other.name.clone())
            .collect()
    }

    /// Handles one message from the area server. Errors mean the server sent
    /// something it never should have.
    pub fn on_stream_message(&mut self, message: StreamMessage) -> Result<StreamFlow> {
        match message {
            StreamMessage::LoginReply {
                error_code,
                hp,
                exp,
                x,
                y,
            } => self.on_login_reply(error_code, hp, exp, x, y)?,
            StreamMessage::MoveNotify(record) => self.on_move_notify(record),
            StreamMessage::AttackNotify {
                attacker,
                victim,
                damage,
                hp,
            } => self.on_attack_notify(attacker, victim, damage, hp)?,
            StreamMessage::SpeakNotify { speaker, text } => {
                if self.player_mut(&speaker).is_none() {
                    return Err(Error::malformed(format!("unknown speaker {}", speaker)));
                }
                self.notify(ConsoleEvent::Speech { speaker, text });
            }
            StreamMessage::LogoutNotify(record) => return self.on_logout_notify(record),
            StreamMessage::InvalidState { error_code } => {
                self.notify(ConsoleEvent::InvalidState { error_code })
            }
            other => {
                return Err(Error::malformed(format!(
                    "server sent a {:?}",
                    other.kind()
                )))
            }
        }
        Ok(StreamFlow::Continue)
    }

    fn on_login_reply(&mut self, error_code: u8, hp: i32, exp: i32, x: u8, y: u8) -> Result<()> {
        if self.state == ClientState::LoggedIn {
            return Err(Error::malformed("login reply while logged in"));
        }
        if error_code > 1 {
            return Err(Error::malformed(format!("login error code {}", error_code)));
        }
        if self.first_login {
            self.first_login = false;
            self.notify(ConsoleEvent::LoginReply { error_code });
        }
        if error_code != 0 {
            return Ok(());
        }
        let me = self
            .me
            .as_ref()
            .ok_or_else(|| Error::malformed("login reply before login"))?;
        if (me.hp, me.exp, me.x, me.y) != (hp, exp, x, y) {
            return Err(Error::malformed(format!(
                "login reply disagrees with the stored state of {}",
                me.name
            )));
        }
        self.state = ClientState::LoggedIn;
        Ok(())
    }

    fn on_move_notify(&mut self, record: UserRecord) {
        let is_me = self.me.as_ref().is_some_and(|me| me.name == record.name);
        if is_me {
            let before = self.visible_others();
            self.me = Some(record.clone());
            for name in self.visible_others() {
                if !before.contains(&name) {
                    if let Some(other) = self.others.get(&name).cloned() {
                        self.notify(ConsoleEvent::PlayerStatus(other));
                    }
                }
            }
        } else {
            self.others.insert(record.name.clone(), record.clone());
        }

        if self.sees(&record) {
            self.notify(ConsoleEvent::PlayerStatus(record.clone()));
        }
        if is_me {
            for edge in self.area.visible_edges(record.location()) {
                self.notify(ConsoleEvent::Boundary(edge));
            }
        }
    }

    fn on_attack_notify(&mut self, attacker: String, victim: String, damage: u8, hp: i32) -> Result<()> {
        let unknown = |name: &str| Error::malformed(format!("attack involving unknown {}", name));
        let damage_done = i32::from(damage);

        let victim_hp = self.player_mut(&victim).ok_or_else(|| unknown(&victim))?.hp;
        if victim_hp - damage_done > hp {
            return Err(Error::malformed(format!(
                "{} cannot have {} hp after {} damage",
                victim, hp, damage
            )));
        }
        self.player_mut(&attacker).ok_or_else(|| unknown(&attacker))?.exp += damage_done;
        if let Some(record) = self.player_mut(&victim) {
            record.hp = hp;
        }

        let visible = [&attacker, &victim].into_iter().all(|name| {
            self.me
                .iter()
                .chain(self.others.values())
                .find(|p| &p.name == name)
                .is_some_and(|p| self.sees(p))
        });
        if visible {
            self.notify(ConsoleEvent::Attack {
                attacker,
                victim,
                damage,
                hp,
            });
        }
        Ok(())
    }

    fn on_logout_notify(&mut self, record: UserRecord) -> Result<StreamFlow> {
        let is_me = self.me.as_ref().is_some_and(|me| me.name == record.name);
        if !is_me {
            if self.others.remove(&record.name).is_none() {
                return Err(Error::malformed(format!("unknown player {} left", record.name)));
            }
            self.notify(ConsoleEvent::PlayerLeft(record.name));
            return Ok(StreamFlow::Continue);
        }

        match self.state {
            ClientState::Switching => self.state = ClientState::NotLoggedIn,
            ClientState::LoggingOut => self.state = ClientState::Finding,
            state => {
                return Err(Error::malformed(format!("logged out while {:?}", state)));
            }
        }
        self.others.clear();
        if let Some(me) = self.me.as_mut() {
            me.hp = record.hp;
            me.exp = record.exp;
        }
        debug!("logged out of {:?}", self.area_server);
        Ok(StreamFlow::Detach)
    }

    fn on_datagram(&mut self, message: UdpMessage, outbox: &mut Outbox) -> Result<Flow> {
        match message {
            UdpMessage::StorageLocationResponse { ip, udp_port } => {
                if self.state != ClientState::Finding {
                    debug!("dropping duplicate storage location response");
                    return Ok(Flow::Continue);
                }
                let storage = SocketAddr::V4(SocketAddrV4::new(ip, udp_port));
                self.storage = Some(storage);
                self.notify(ConsoleEvent::LocationResponse { ip, udp_port });

                if self.logging_out || self.autosave {
                    let me = self
                        .me
                        .clone()
                        .ok_or_else(|| Error::violation("nothing to save"))?;
                    self.state = ClientState::Saving;
                    self.request(outbox, storage, UdpMessage::SaveStateRequest(me));
                } else {
                    self.state = ClientState::Grabbing;
                    let name = self.name.clone();
                    self.request(outbox, storage, UdpMessage::PlayerStateRequest { name });
                }
            }
            UdpMessage::PlayerStateResponse(record) => {
                if self.state != ClientState::Grabbing {
                    debug!("dropping duplicate player state response");
                    return Ok(Flow::Continue);
                }
                if record.name != self.name {
                    return Err(Error::malformed(format!("state of {} instead of {}", record.name, self.name)));
                }
                let (x, y) = (record.x, record.y);
                self.me = Some(record.clone());
                self.state = ClientState::NotLoggedIn;
                self.notify(ConsoleEvent::StateResponse(record));
                self.request(outbox, self.tracker, UdpMessage::ServerAreaRequest { x, y });
            }
            UdpMessage::ServerAreaResponse { ip, tcp_port, area } => {
                if self.state != ClientState::NotLoggedIn {
                    debug!("dropping duplicate server area response");
                    return Ok(Flow::Continue);
                }
                self.area_server = Some(SocketAddr::V4(SocketAddrV4::new(ip, tcp_port)));
                self.area = area;
                self.notify(ConsoleEvent::AreaResponse { ip, tcp_port, area });
                return Ok(Flow::Stop);
            }
            UdpMessage::SaveStateResponse { error_code } => {
                if self.state != ClientState::Saving {
                    debug!("dropping duplicate save state response");
                    return Ok(Flow::Continue);
                }
                self.notify(ConsoleEvent::SaveResponse { error_code });
                if self.autosave {
                    self.autosave_done = true;
                } else {
                    self.state = ClientState::GameOver;
                }
                return Ok(Flow::Stop);
            }
            other => {
                return Err(Error::malformed(format!("unexpected {:?}", other.kind())));
            }
        }
        Ok(Flow::Continue)
    }
}

impl<C: Console> DatagramHandler for ClientSession<C> {
    fn handle(&mut self, datagram: &Datagram, outbox: &mut Outbox) -> Result<Flow> {
        let result = datagram
            .message()
            .and_then(|message| self.on_datagram(message, outbox));
        match result {
            Err(Error::MalformedMessage(reason)) => {
                debug!("dropping datagram from {}: {}", datagram.source, reason);
                self.notify(ConsoleEvent::MalformedUdp);
                Ok(Flow::Continue)
            }
            other => other,
        }
    }

    fn on_attempt(&mut self, attempt: u32) {
        self.notify(ConsoleEvent::UdpAttempt(attempt));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::RecordingConsole;
    use shared::world::Direction;
    use std::net::Ipv4Addr;

    const TRACKER: &str = "127.0.0.1:1026";
    const STORAGE: &str = "127.0.0.1:1027";

    fn session() -> ClientSession<RecordingConsole> {
        ClientSession::with_sequence(RecordingConsole::new(), TRACKER.parse().unwrap(), 100)
    }

    fn reply(
        session: &mut ClientSession<RecordingConsole>,
        from: &str,
        message: UdpMessage,
    ) -> (Flow, Vec<(SocketAddr, u32, UdpMessage)>) {
        let packet = message.encode(0).unwrap();
        let datagram = Datagram::parse(&packet, from.parse().unwrap()).unwrap();
        let mut outbox = Outbox::new();
        let flow = session.handle(&datagram, &mut outbox).unwrap();
        (flow, outbox.drain().collect())
    }

    fn area(min_x: u8, max_x: u8) -> Area {
        Area {
            min_x,
            max_x,
            min_y: 0,
            max_y: 99,
        }
    }

    /// Drives a fresh session through every lookup up to the TCP login.
    fn logged_in(record: UserRecord, owned: Area) -> ClientSession<RecordingConsole> {
        let mut session = session();
        session.on_line(&format!("login {}", record.name));
        let mut outbox = Outbox::new();
        session.begin_lookup(&mut outbox).unwrap();
        reply(
            &mut session,
            TRACKER,
            UdpMessage::StorageLocationResponse {
                ip: Ipv4Addr::LOCALHOST,
                udp_port: 1027,
            },
        );
        reply(&mut session, STORAGE, UdpMessage::PlayerStateResponse(record.clone()));
        reply(
            &mut session,
            TRACKER,
            UdpMessage::ServerAreaResponse {
                ip: Ipv4Addr::LOCALHOST,
                tcp_port: 2000,
                area: owned,
            },
        );
        session.begin_login().unwrap();
        session.take_outgoing();
        session
            .on_stream_message(StreamMessage::LoginReply {
                error_code: 0,
                hp: record.hp,
                exp: record.exp,
                x: record.x,
                y: record.y,
            })
            .unwrap();
        session.console_mut().events.clear();
        session
    }

    #[test]
    fn test_commands_before_login() {
        let mut session = session();
        session.on_line("move north");
        session.on_line("dance");
        assert_eq!(session.state(), ClientState::NoState);
        assert_eq!(session.console().events[0], ConsoleEvent::BeforeLogin);
        assert!(matches!(session.console().events[1], ConsoleEvent::InvalidInput(_)));

        session.on_line("login alice");
        assert_eq!(session.state(), ClientState::Finding);
    }

    #[test]
    fn test_lookup_sequence() {
        let mut session = session();
        session.on_line("login alice");
        let mut outbox = Outbox::new();
        session.begin_lookup(&mut outbox).unwrap();
        let sent: Vec<_> = outbox.drain().collect();
        assert_eq!(
            sent,
            vec![(
                TRACKER.parse().unwrap(),
                101,
                UdpMessage::StorageLocationRequest { name: "alice".into() }
            )]
        );

        let (flow, sent) = reply(
            &mut session,
            TRACKER,
            UdpMessage::StorageLocationResponse {
                ip: Ipv4Addr::LOCALHOST,
                udp_port: 1027,
            },
        );
        assert_eq!(flow, Flow::Continue);
        assert_eq!(session.state(), ClientState::Grabbing);
        assert_eq!(
            sent,
            vec![(
                STORAGE.parse().unwrap(),
                102,
                UdpMessage::PlayerStateRequest { name: "alice".into() }
            )]
        );

        let alice = UserRecord::new("alice", 105, 0, 60, 7);
        let (_, sent) = reply(&mut session, STORAGE, UdpMessage::PlayerStateResponse(alice.clone()));
        assert_eq!(session.state(), ClientState::NotLoggedIn);
        assert_eq!(sent[0].2, UdpMessage::ServerAreaRequest { x: 60, y: 7 });

        let (flow, _) = reply(
            &mut session,
            TRACKER,
            UdpMessage::ServerAreaResponse {
                ip: Ipv4Addr::LOCALHOST,
                tcp_port: 2000,
                area: area(50, 99),
            },
        );
        assert_eq!(flow, Flow::Stop);
        assert_eq!(session.area_server(), Some("127.0.0.1:2000".parse().unwrap()));

        session.begin_login().unwrap();
        assert_eq!(session.take_outgoing(), vec![StreamMessage::LoginRequest(alice)]);
    }

    #[test]
    fn test_stale_and_foreign_datagrams_are_dropped() {
        let mut session = session();
        session.on_line("login alice");
        let (flow, sent) = reply(&mut session, STORAGE, UdpMessage::SaveStateResponse { error_code: 0 });
        assert_eq!(flow, Flow::Continue);
        assert!(sent.is_empty());

        let (flow, _) = reply(&mut session, TRACKER, UdpMessage::ServerAreaRequest { x: 1, y: 1 });
        assert_eq!(flow, Flow::Continue);
        assert_eq!(session.console().events, vec![ConsoleEvent::MalformedUdp]);
        assert_eq!(session.state(), ClientState::Finding);
    }

    #[test]
    fn test_login_reply_must_match_state() {
        let mut session = logged_in(UserRecord::new("alice", 100, 0, 10, 10), area(0, 49));
        assert_eq!(session.state(), ClientState::LoggedIn);
        let again = StreamMessage::LoginReply {
            error_code: 0,
            hp: 100,
            exp: 0,
            x: 10,
            y: 10,
        };
        assert!(session.on_stream_message(again).is_err());
    }

    #[test]
    fn test_vision_filters_notifications() {
        let mut session = logged_in(UserRecord::new("alice", 100, 0, 10, 10), area(0, 49));
        session
            .on_stream_message(StreamMessage::MoveNotify(UserRecord::new("bob", 90, 1, 30, 30)))
            .unwrap();
        assert!(session.console().events.is_empty());

        session.on_line("attack bob");
        assert_eq!(session.console().events, vec![ConsoleEvent::NotVisible]);
        assert!(session.take_outgoing().is_empty());

        session
            .on_stream_message(StreamMessage::MoveNotify(UserRecord::new("bob", 90, 1, 12, 12)))
            .unwrap();
        session.on_line("attack bob");
        assert_eq!(
            session.take_outgoing(),
            vec![StreamMessage::Attack { victim: "bob".into() }]
        );

        session.console_mut().events.clear();
        session
            .on_stream_message(StreamMessage::AttackNotify {
                attacker: "alice".into(),
                victim: "bob".into(),
                damage: 15,
                hp: 75,
            })
            .unwrap();
        assert_eq!(session.me().unwrap().exp, 15);
        assert_eq!(
            session.console().lines(),
            vec!["alice damaged bob by 15. bob's HP is now 75"]
        );
    }

    #[test]
    fn test_moving_reveals_players_and_edges() {
        let mut session = logged_in(UserRecord::new("alice", 100, 0, 42, 50), area(0, 49));
        session
            .on_stream_message(StreamMessage::MoveNotify(UserRecord::new("bob", 90, 1, 49, 50)))
            .unwrap();
        assert!(session.console().events.is_empty());

        session
            .on_stream_message(StreamMessage::MoveNotify(UserRecord::new("alice", 100, 0, 45, 50)))
            .unwrap();
        assert_eq!(
            session.console().lines(),
            vec![
                "bob: location=(49,50), HP=90, EXP=1",
                "alice: location=(45,50), HP=100, EXP=0",
                "Cannot see past x-boundary at: 49.",
            ]
        );
    }

    #[test]
    fn test_move_out_of_area_switches_server() {
        let mut session = logged_in(UserRecord::new("alice", 100, 0, 48, 10), area(0, 49));
        session.on_line("move east");
        assert_eq!(session.state(), ClientState::Switching);
        assert_eq!(session.take_outgoing(), vec![StreamMessage::Logout]);
        assert_eq!(session.me().unwrap().x, 51);

        let flow = session
            .on_stream_message(StreamMessage::LogoutNotify(UserRecord::new("alice", 100, 0, 48, 10)))
            .unwrap();
        assert_eq!(flow, StreamFlow::Detach);
        assert_eq!(session.state(), ClientState::NotLoggedIn);

        let mut outbox = Outbox::new();
        session.begin_lookup(&mut outbox).unwrap();
        let sent: Vec<_> = outbox.drain().collect();
        assert_eq!(sent[0].2, UdpMessage::ServerAreaRequest { x: 51, y: 10 });
    }

    #[test]
    fn test_game_commands_wait_for_the_next_server() {
        let mut session = logged_in(UserRecord::new("alice", 100, 0, 48, 10), area(0, 49));
        session.on_line("move east");
        assert_eq!(session.state(), ClientState::Switching);
        session.take_outgoing();
        session.console_mut().events.clear();

        session.on_line("speak hello");
        session.on_line("move west");
        session.on_line("attack bob");
        session.on_line("logout");
        assert!(session.take_outgoing().is_empty());
        assert_eq!(session.state(), ClientState::Switching);
        assert_eq!(session.me().unwrap().x, 51);
        assert_eq!(
            session.console().events,
            vec![ConsoleEvent::InvalidState { error_code: 0 }; 4]
        );

        session.on_line("map");
        assert!(matches!(session.console().events[4], ConsoleEvent::Map(_)));
    }

    #[test]
    fn test_logout_saves_then_ends() {
        let mut session = logged_in(UserRecord::new("alice", 100, 0, 10, 10), area(0, 49));
        session.on_line("logout");
        assert_eq!(session.take_outgoing(), vec![StreamMessage::Logout]);

        let flow = session
            .on_stream_message(StreamMessage::LogoutNotify(UserRecord::new("alice", 80, 9, 10, 10)))
            .unwrap();
        assert_eq!(flow, StreamFlow::Detach);
        assert_eq!(session.state(), ClientState::Finding);

        reply(
            &mut session,
            TRACKER,
            UdpMessage::StorageLocationResponse {
                ip: Ipv4Addr::LOCALHOST,
                udp_port: 1027,
            },
        );
        assert_eq!(session.state(), ClientState::Saving);
        let (flow, _) = reply(&mut session, STORAGE, UdpMessage::SaveStateResponse { error_code: 0 });
        assert_eq!(flow, Flow::Stop);
        assert_eq!(session.state(), ClientState::GameOver);
        assert!(session
            .console()
            .lines()
            .contains(&"**Save Resp - TYPE: 7 RESULT: Success.".to_string()));
    }

    #[test]
    fn test_autosave_returns_to_game() {
        let mut session = logged_in(UserRecord::new("alice", 100, 0, 10, 10), area(0, 49));
        assert!(session.begin_autosave());
        let mut outbox = Outbox::new();
        session.begin_lookup(&mut outbox).unwrap();

        let (_, sent) = reply(
            &mut session,
            TRACKER,
            UdpMessage::StorageLocationResponse {
                ip: Ipv4Addr::LOCALHOST,
                udp_port: 1027,
            },
        );
        assert!(matches!(&sent[0].2, UdpMessage::SaveStateRequest(r) if r.name == "alice"));
        let (flow, _) = reply(&mut session, STORAGE, UdpMessage::SaveStateResponse { error_code: 0 });
        assert_eq!(flow, Flow::Stop);
        session.finish_autosave();
        assert_eq!(session.state(), ClientState::LoggedIn);
    }

    #[test]
    fn test_unknown_players_are_malformed() {
        let mut session = logged_in(UserRecord::new("alice", 100, 0, 10, 10), area(0, 49));
        assert!(session
            .on_stream_message(StreamMessage::SpeakNotify {
                speaker: "ghost".into(),
                text: "boo".into()
            })
            .is_err());
        assert!(session
            .on_stream_message(StreamMessage::LogoutNotify(UserRecord::new("ghost", 1, 1, 1, 1)))
            .is_err());
        assert!(session.on_stream_message(StreamMessage::Logout).is_err());
        assert!(session
            .on_stream_message(StreamMessage::Move { direction: Direction::North })
            .is_err());
    }
}
