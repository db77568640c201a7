//! Protocol core shared by the client, the area servers and the tracker:
//! wire codecs for the stream and datagram protocols, the reliable datagram
//! engine, ring membership math and the collaborators that persist users
//! and the peer roster.

pub mod datagram;
pub mod error;
pub mod reliable;
pub mod ring;
pub mod roster;
pub mod stream;
pub mod udp_engine;
pub mod user_store;
pub mod wire;
pub mod world;

pub use error::{Error, Result};

pub const PROTOCOL_VERSION: u8 = 4;
pub const MAX_LOGIN_LENGTH: usize = 9;
pub const NAME_FIELD_LENGTH: usize = MAX_LOGIN_LENGTH + 1;
pub const MAX_MSG_LENGTH: usize = 255;
pub const MAX_PACKET_LENGTH: usize = 300;
pub const DUNGEON_SIZE_X: u8 = 100;
pub const DUNGEON_SIZE_Y: u8 = 100;
pub const VISION_RANGE: u8 = 5;
pub const MAX_NUM_SENT_HISTORY: usize = 50;

/// Persistent state of one player, as stored on disk and migrated between
/// servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub name: String,
    pub hp: i32,
    pub exp: i32,
    pub x: u8,
    pub y: u8,
}

impl UserRecord {
    pub fn new(name: impl Into<String>, hp: i32, exp: i32, x: u8, y: u8) -> Self {
        Self {
            name: name.into(),
            hp,
            exp,
            x,
            y,
        }
    }

    pub fn location(&self) -> world::Location {
        world::Location::new(self.x, self.y)
    }

    pub fn set_location(&mut self, location: world::Location) {
        self.x = location.x;
        self.y = location.y;
    }

    /// Checks the semantic constraints every record on the wire must meet.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_name(&self.name) {
            return Err(Error::malformed(format!("invalid player name {:?}", self.name)));
        }
        if self.hp < 0 || self.exp < 0 {
            return Err(Error::malformed(format!(
                "negative stats for {}: hp={} exp={}",
                self.name, self.hp, self.exp
            )));
        }
        if self.x >= DUNGEON_SIZE_X || self.y >= DUNGEON_SIZE_Y {
            return Err(Error::malformed(format!(
                "location ({}, {}) is outside the dungeon",
                self.x, self.y
            )));
        }
        Ok(())
    }
}

/// Player names are 1..=9 ASCII alphanumerics.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_LOGIN_LENGTH
        && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Chat text must be printable, at most 255 bytes and not only spaces.
pub fn is_valid_message(text: &str) -> bool {
    !text.is_empty()
        && text.len() <= MAX_MSG_LENGTH
        && text.bytes().all(|b| (0x20..0x7f).contains(&b))
        && text.bytes().any(|b| b != b' ')
}
