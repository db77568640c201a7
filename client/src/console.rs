//! Everything the player sees on the terminal

use crate::input::InputError;
use shared::datagram::DatagramKind;
use shared::world::{Area, Boundary};
use shared::UserRecord;
use std::fmt;
use std::io::Write;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    UdpAttempt(u32),
    UdpFailure,
    MalformedUdp,
    LocationResponse {
        ip: Ipv4Addr,
        udp_port: u16,
    },
    StateResponse(UserRecord),
    AreaResponse {
        ip: Ipv4Addr,
        tcp_port: u16,
        area: Area,
    },
    SaveResponse {
        error_code: u8,
    },
    BeforeLogin,
    Boundary(Boundary),
    ConnectFailure,
    MalformedFromServer,
    Disconnected,
    NotVisible,
    LoginReply {
        error_code: u8,
    },
    PlayerStatus(UserRecord),
    Attack {
        attacker: String,
        victim: String,
        damage: u8,
        hp: i32,
    },
    Speech {
        speaker: String,
        text: String,
    },
    PlayerLeft(String),
    InvalidState {
        error_code: u8,
    },
    InvalidInput(InputError),
    Map(String),
}

impl fmt::Display for ConsoleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsoleEvent::UdpAttempt(attempt) => {
                write!(f, "**UDP transmission attempt:{}.", attempt)
            }
            ConsoleEvent::UdpFailure => write!(f, "Error: did not obtain response from server."),
            ConsoleEvent::MalformedUdp => write!(f, "**Received malformed UDP packet."),
            ConsoleEvent::LocationResponse { ip, udp_port } => write!(
                f,
                "**LOC Resp - TYPE: {} IPADDR: {:x} UDPPORT: {:x}.",
                DatagramKind::StorageLocationResponse as u8,
                u32::from(*ip),
                udp_port
            ),
            ConsoleEvent::StateResponse(record) => write!(
                f,
                "**State Resp - TYPE: {} NAME: {} HP: {} EXP: {} XLOC: {} YLOC: {}.",
                DatagramKind::PlayerStateResponse as u8,
                record.name,
                record.hp,
                record.exp,
                record.x,
                record.y
            ),
            ConsoleEvent::AreaResponse { ip, tcp_port, area } => write!(
                f,
                "**Area Resp - TYPE: {} IPADDR: {:x} PORT: {:x} MINX: {} MAXX: {} MINY: {} MAXY: {}",
                DatagramKind::ServerAreaResponse as u8,
                u32::from(*ip),
                tcp_port,
                area.min_x,
                area.max_x,
                area.min_y,
                area.max_y
            ),
            ConsoleEvent::SaveResponse { error_code } => {
                let result = if *error_code == 0 { "Success" } else { "FAILURE" };
                write!(
                    f,
                    "**Save Resp - TYPE: {} RESULT: {}.",
                    DatagramKind::SaveStateResponse as u8,
                    result
                )
            }
            ConsoleEvent::BeforeLogin => write!(f, "Must login before using this command."),
            ConsoleEvent::Boundary(Boundary::X(at)) => {
                write!(f, "Cannot see past x-boundary at: {}.", at)
            }
            ConsoleEvent::Boundary(Boundary::Y(at)) => {
                write!(f, "Cannot see past y-boundary at: {}.", at)
            }
            ConsoleEvent::ConnectFailure => {
                write!(f, "The gate to the tiny world of warcraft is not ready.")
            }
            ConsoleEvent::MalformedFromServer => write!(f, "Meteor is striking the world."),
            ConsoleEvent::Disconnected => {
                write!(f, "The gate to the tiny world of warcraft has disappeared.")
            }
            ConsoleEvent::NotVisible => write!(f, "The target is not visible."),
            ConsoleEvent::LoginReply { error_code: 0 } => {
                write!(f, "Welcome to the tiny world of warcraft.")
            }
            ConsoleEvent::LoginReply { .. } => {
                write!(f, "A player with the same name is already in the game.")
            }
            ConsoleEvent::PlayerStatus(record) => write!(
                f,
                "{}: location=({},{}), HP={}, EXP={}",
                record.name, record.x, record.y, record.hp, record.exp
            ),
            ConsoleEvent::Attack {
                attacker,
                victim,
                hp,
                ..
            } if *hp <= 0 => write!(f, "{} killed {}", attacker, victim),
            ConsoleEvent::Attack {
                attacker,
                victim,
                damage,
                hp,
            } => write!(
                f,
                "{} damaged {} by {}. {}'s HP is now {}",
                attacker, victim, damage, victim, hp
            ),
            ConsoleEvent::Speech { speaker, text } => write!(f, "{}: {}", speaker, text),
            ConsoleEvent::PlayerLeft(name) => {
                write!(f, "Player {} has left the tiny world of warcraft.", name)
            }
            ConsoleEvent::InvalidState { error_code: 0 } => write!(f, "You must log in first."),
            ConsoleEvent::InvalidState { .. } => write!(f, "You already logged in."),
            ConsoleEvent::InvalidInput(error) => match error {
                InputError::InvalidCommand(command) => write!(
                    f,
                    "! Invalid command: {}.\nAvailable commands = login, move, attack, speak, logout",
                    command
                ),
                InputError::InvalidName(name) => write!(f, "! Invalid name: {}.", name),
                InputError::InvalidMessage => write!(f, "! Invalid text message."),
                InputError::InvalidSyntax => write!(f, "! Invalid syntax."),
                InputError::InvalidDirection(direction) => {
                    write!(f, "! Invalid direction: {}", direction)
                }
            },
            ConsoleEvent::Map(map) => write!(f, "{}", map.trim_end()),
        }
    }
}

/// Sink for user-visible notifications
pub trait Console {
    fn notify(&mut self, event: ConsoleEvent);

    fn prompt(&mut self) {}
}

#[derive(Debug, Default)]
pub struct StdoutConsole;

impl Console for StdoutConsole {
    fn notify(&mut self, event: ConsoleEvent) {
        println!("{}", event);
    }

    fn prompt(&mut self) {
        print!("command> ");
        let _ = std::io::stdout().flush();
    }
}

/// Keeps every notification, for tests and scripted sessions
#[derive(Debug, Default)]
pub struct RecordingConsole {
    pub events: Vec<ConsoleEvent>,
}

impl RecordingConsole {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.events.iter().map(ToString::to_string).collect()
    }
}

impl Console for RecordingConsole {
    fn notify(&mut self, event: ConsoleEvent) {
        self.events.push(event);
    }
}
