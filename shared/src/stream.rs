//! Stream protocol: framed game and ring messages carried over TCP.
//!
//! Every frame starts with a 4 byte header (`version`, `total_length`,
//! `msg_type`) where `total_length` covers header and payload and is always
//! a multiple of four. [`StreamBuffer`] reassembles frames from arbitrary
//! read boundaries.

use crate::wire::{
    self, decode_name, encode_name, from_bytes, padded_length, to_bytes, NameField, RecordBody,
    RECORD_BODY_LENGTH,
};
use crate::world::Direction;
use crate::{
    is_valid_message, Error, Result, UserRecord, MAX_PACKET_LENGTH, NAME_FIELD_LENGTH,
    PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};

pub const HEADER_LENGTH: usize = 4;
/// Exclusive upper bound of the message type range.
pub const MAX_MESSAGE: u8 = 20;
/// Largest frame a `u16` length can describe while staying 4 byte aligned.
pub const MAX_JOIN_RESPONSE_LENGTH: usize = 65532;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    LoginRequest = 1,
    LoginReply = 2,
    Move = 3,
    MoveNotify = 4,
    Attack = 5,
    AttackNotify = 6,
    Speak = 7,
    SpeakNotify = 8,
    Logout = 9,
    LogoutNotify = 10,
    InvalidState = 11,
    JoinRequest = 16,
    JoinResponse = 17,
    BackupRequest = 18,
    BackupResponse = 19,
}

impl StreamKind {
    /// Types 12..=15 are reserved and never valid on the wire.
    pub fn from_u8(value: u8) -> Option<Self> {
        use StreamKind::*;
        let kind = match value {
            1 => LoginRequest,
            2 => LoginReply,
            3 => Move,
            4 => MoveNotify,
            5 => Attack,
            6 => AttackNotify,
            7 => Speak,
            8 => SpeakNotify,
            9 => Logout,
            10 => LogoutNotify,
            11 => InvalidState,
            16 => JoinRequest,
            17 => JoinResponse,
            18 => BackupRequest,
            19 => BackupResponse,
            _ => return None,
        };
        Some(kind)
    }

    pub fn max_length(self) -> usize {
        match self {
            StreamKind::JoinResponse => MAX_JOIN_RESPONSE_LENGTH,
            _ => MAX_PACKET_LENGTH,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Header {
    version: u8,
    total_length: u16,
    msg_type: u8,
}

impl Header {
    /// Validates the fixed header at the front of `bytes`.
    fn parse(bytes: &[u8]) -> Result<(StreamKind, usize)> {
        let header: Header = from_bytes(&bytes[..HEADER_LENGTH])?;
        if header.version != PROTOCOL_VERSION {
            return Err(Error::malformed(format!(
                "unsupported protocol version {}",
                header.version
            )));
        }
        let total = header.total_length as usize;
        if total % 4 != 0 || total < HEADER_LENGTH {
            return Err(Error::malformed(format!("invalid frame length {}", total)));
        }
        let kind = StreamKind::from_u8(header.msg_type)
            .ok_or_else(|| Error::malformed(format!("unknown message type {}", header.msg_type)))?;
        if total > kind.max_length() {
            return Err(Error::malformed(format!(
                "{:?} frame of {} bytes exceeds {}",
                kind,
                total,
                kind.max_length()
            )));
        }
        Ok((kind, total))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LoginReplyBody {
    error_code: u8,
    hp: i32,
    exp: i32,
    x: u8,
    y: u8,
    padding: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct MoveBody {
    direction: u8,
    padding: [u8; 3],
}

#[derive(Debug, Serialize, Deserialize)]
struct MoveNotifyBody {
    name: NameField,
    x: u8,
    y: u8,
    hp: i32,
    exp: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct AttackBody {
    victim: NameField,
    padding: [u8; 2],
}

#[derive(Debug, Serialize, Deserialize)]
struct AttackNotifyBody {
    attacker: NameField,
    victim: NameField,
    damage: u8,
    hp: i32,
    padding: [u8; 3],
}

#[derive(Debug, Serialize, Deserialize)]
struct CodeBody {
    code: u8,
    padding: [u8; 3],
}

#[derive(Debug, Serialize, Deserialize)]
struct JoinRequestBody {
    ring_id: u32,
}

/// One decoded stream message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    LoginRequest(UserRecord),
    LoginReply {
        error_code: u8,
        hp: i32,
        exp: i32,
        x: u8,
        y: u8,
    },
    Move {
        direction: Direction,
    },
    MoveNotify(UserRecord),
    Attack {
        victim: String,
    },
    AttackNotify {
        attacker: String,
        victim: String,
        damage: u8,
        hp: i32,
    },
    Speak {
        text: String,
    },
    SpeakNotify {
        speaker: String,
        text: String,
    },
    Logout,
    LogoutNotify(UserRecord),
    InvalidState {
        error_code: u8,
    },
    JoinRequest {
        ring_id: u32,
    },
    JoinResponse {
        users: Vec<UserRecord>,
    },
    BackupRequest(UserRecord),
    BackupResponse {
        status: u8,
    },
}

impl StreamMessage {
    pub fn kind(&self) -> StreamKind {
        match self {
            StreamMessage::LoginRequest(_) => StreamKind::LoginRequest,
            StreamMessage::LoginReply { .. } => StreamKind::LoginReply,
            StreamMessage::Move { .. } => StreamKind::Move,
            StreamMessage::MoveNotify(_) => StreamKind::MoveNotify,
            StreamMessage::Attack { .. } => StreamKind::Attack,
            StreamMessage::AttackNotify { .. } => StreamKind::AttackNotify,
            StreamMessage::Speak { .. } => StreamKind::Speak,
            StreamMessage::SpeakNotify { .. } => StreamKind::SpeakNotify,
            StreamMessage::Logout => StreamKind::Logout,
            StreamMessage::LogoutNotify(_) => StreamKind::LogoutNotify,
            StreamMessage::InvalidState { .. } => StreamKind::InvalidState,
            StreamMessage::JoinRequest { .. } => StreamKind::JoinRequest,
            StreamMessage::JoinResponse { .. } => StreamKind::JoinResponse,
            StreamMessage::BackupRequest(_) => StreamKind::BackupRequest,
            StreamMessage::BackupResponse { .. } => StreamKind::BackupResponse,
        }
    }

    /// Encodes the message into one complete frame.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = self.encode_payload()?;
        let kind = self.kind();
        let total = HEADER_LENGTH + payload.len();
        if total > kind.max_length() {
            let detail = match self {
                StreamMessage::JoinResponse { users } => format!(" ({} users)", users.len()),
                _ => String::new(),
            };
            return Err(Error::malformed(format!(
                "{:?} frame of {} bytes exceeds {}{}",
                kind,
                total,
                kind.max_length(),
                detail
            )));
        }
        let header = Header {
            version: PROTOCOL_VERSION,
            total_length: total as u16,
            msg_type: kind as u8,
        };
        let mut frame = to_bytes(&header)?;
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    fn encode_payload(&self) -> Result<Vec<u8>> {
        match self {
            StreamMessage::LoginRequest(record)
            | StreamMessage::LogoutNotify(record)
            | StreamMessage::BackupRequest(record) => to_bytes(&RecordBody::from_record(record)?),
            StreamMessage::LoginReply {
                error_code,
                hp,
                exp,
                x,
                y,
            } => to_bytes(&LoginReplyBody {
                error_code: *error_code,
                hp: *hp,
                exp: *exp,
                x: *x,
                y: *y,
                padding: 0,
            }),
            StreamMessage::Move { direction } => to_bytes(&MoveBody {
                direction: *direction as u8,
                padding: [0; 3],
            }),
            StreamMessage::MoveNotify(record) => {
                record.validate()?;
                to_bytes(&MoveNotifyBody {
                    name: encode_name(&record.name)?,
                    x: record.x,
                    y: record.y,
                    hp: record.hp,
                    exp: record.exp,
                })
            }
            StreamMessage::Attack { victim } => to_bytes(&AttackBody {
                victim: encode_name(victim)?,
                padding: [0; 2],
            }),
            StreamMessage::AttackNotify {
                attacker,
                victim,
                damage,
                hp,
            } => to_bytes(&AttackNotifyBody {
                attacker: encode_name(attacker)?,
                victim: encode_name(victim)?,
                damage: *damage,
                hp: *hp,
                padding: [0; 3],
            }),
            StreamMessage::Speak { text } => {
                check_text(text)?;
                let mut out = Vec::with_capacity(padded_length(text.len() + 1));
                wire::put_text(&mut out, text);
                Ok(out)
            }
            StreamMessage::SpeakNotify { speaker, text } => {
                check_text(text)?;
                let mut out = encode_name(speaker)?.to_vec();
                wire::put_text(&mut out, text);
                Ok(out)
            }
            StreamMessage::Logout => Ok(Vec::new()),
            StreamMessage::InvalidState { error_code } => to_bytes(&CodeBody {
                code: *error_code,
                padding: [0; 3],
            }),
            StreamMessage::JoinRequest { ring_id } => to_bytes(&JoinRequestBody { ring_id: *ring_id }),
            StreamMessage::JoinResponse { users } => {
                let mut out = to_bytes(&(users.len() as u32))?;
                for user in users {
                    out.extend(to_bytes(&RecordBody::from_record(user)?)?);
                }
                Ok(out)
            }
            StreamMessage::BackupResponse { status } => to_bytes(&CodeBody {
                code: *status,
                padding: [0; 3],
            }),
        }
    }

    /// Decodes one complete frame, header included.
    pub fn decode(frame: &[u8]) -> Result<StreamMessage> {
        if frame.len() < HEADER_LENGTH {
            return Err(Error::malformed("frame shorter than its header"));
        }
        let (kind, total) = Header::parse(frame)?;
        if total != frame.len() {
            return Err(Error::malformed(format!(
                "frame declares {} bytes but holds {}",
                total,
                frame.len()
            )));
        }
        let body = &frame[HEADER_LENGTH..];
        let message = match kind {
            StreamKind::LoginRequest => {
                StreamMessage::LoginRequest(from_bytes::<RecordBody>(body)?.into_record()?)
            }
            StreamKind::LoginReply => {
                let reply: LoginReplyBody = from_bytes(body)?;
                StreamMessage::LoginReply {
                    error_code: reply.error_code,
                    hp: reply.hp,
                    exp: reply.exp,
                    x: reply.x,
                    y: reply.y,
                }
            }
            StreamKind::Move => {
                let body: MoveBody = from_bytes(body)?;
                let direction = Direction::from_u8(body.direction).ok_or_else(|| {
                    Error::malformed(format!("invalid direction {}", body.direction))
                })?;
                StreamMessage::Move { direction }
            }
            StreamKind::MoveNotify => {
                let body: MoveNotifyBody = from_bytes(body)?;
                let record = UserRecord {
                    name: decode_name(&body.name)?,
                    hp: body.hp,
                    exp: body.exp,
                    x: body.x,
                    y: body.y,
                };
                record.validate()?;
                StreamMessage::MoveNotify(record)
            }
            StreamKind::Attack => {
                let body: AttackBody = from_bytes(body)?;
                StreamMessage::Attack {
                    victim: decode_name(&body.victim)?,
                }
            }
            StreamKind::AttackNotify => {
                let body: AttackNotifyBody = from_bytes(body)?;
                if body.hp < 0 {
                    return Err(Error::malformed(format!("negative hp {}", body.hp)));
                }
                StreamMessage::AttackNotify {
                    attacker: decode_name(&body.attacker)?,
                    victim: decode_name(&body.victim)?,
                    damage: body.damage,
                    hp: body.hp,
                }
            }
            StreamKind::Speak => {
                let text = wire::take_text(body)?;
                check_text(&text)?;
                StreamMessage::Speak { text }
            }
            StreamKind::SpeakNotify => {
                if body.len() <= NAME_FIELD_LENGTH {
                    return Err(Error::malformed("speak notification without text"));
                }
                let mut name = [0u8; NAME_FIELD_LENGTH];
                name.copy_from_slice(&body[..NAME_FIELD_LENGTH]);
                let speaker = decode_name(&name)?;
                let text = take_notify_text(&body[NAME_FIELD_LENGTH..])?;
                check_text(&text)?;
                StreamMessage::SpeakNotify { speaker, text }
            }
            StreamKind::Logout => {
                if !body.is_empty() {
                    return Err(Error::malformed("logout carries a payload"));
                }
                StreamMessage::Logout
            }
            StreamKind::LogoutNotify => {
                StreamMessage::LogoutNotify(from_bytes::<RecordBody>(body)?.into_record()?)
            }
            StreamKind::InvalidState => StreamMessage::InvalidState {
                error_code: from_bytes::<CodeBody>(body)?.code,
            },
            StreamKind::JoinRequest => StreamMessage::JoinRequest {
                ring_id: from_bytes::<JoinRequestBody>(body)?.ring_id,
            },
            StreamKind::JoinResponse => StreamMessage::JoinResponse {
                users: decode_user_list(body)?,
            },
            StreamKind::BackupRequest => {
                StreamMessage::BackupRequest(from_bytes::<RecordBody>(body)?.into_record()?)
            }
            StreamKind::BackupResponse => StreamMessage::BackupResponse {
                status: from_bytes::<CodeBody>(body)?.code,
            },
        };
        Ok(message)
    }
}

fn check_text(text: &str) -> Result<()> {
    if is_valid_message(text) {
        Ok(())
    } else {
        Err(Error::malformed(format!("invalid chat text {:?}", text)))
    }
}

/// Speak notifications pad the whole payload, name field included.
fn take_notify_text(bytes: &[u8]) -> Result<String> {
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::malformed("text is not NUL terminated"))?;
    if padded_length(NAME_FIELD_LENGTH + end + 1) != NAME_FIELD_LENGTH + bytes.len() {
        return Err(Error::malformed("speak notification padding mismatch"));
    }
    std::str::from_utf8(&bytes[..end])
        .map(str::to_string)
        .map_err(|_| Error::malformed("text is not ASCII"))
}

fn decode_user_list(body: &[u8]) -> Result<Vec<UserRecord>> {
    if body.len() < 4 {
        return Err(Error::malformed("join response without a user count"));
    }
    let count: u32 = from_bytes(&body[..4])?;
    let records = &body[4..];
    if records.len() != count as usize * RECORD_BODY_LENGTH {
        return Err(Error::malformed(format!(
            "join response declares {} users in {} bytes",
            count,
            records.len()
        )));
    }
    records
        .chunks_exact(RECORD_BODY_LENGTH)
        .map(|chunk| from_bytes::<RecordBody>(chunk)?.into_record())
        .collect()
}

/// Per-connection reassembly buffer.
///
/// Bytes are appended as they arrive and complete frames are taken from the
/// front. A header that fails validation poisons the connection: the caller
/// must tear it down.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    bytes: Vec<u8>,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.bytes.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    /// Removes the next complete frame, or returns `None` until enough bytes
    /// have arrived.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.bytes.len() < HEADER_LENGTH {
            return Ok(None);
        }
        let (_, total) = Header::parse(&self.bytes)?;
        if self.bytes.len() < total {
            return Ok(None);
        }
        Ok(Some(self.bytes.drain(..total).collect()))
    }

    pub fn next_message(&mut self) -> Result<Option<StreamMessage>> {
        match self.next_frame()? {
            Some(frame) => StreamMessage::decode(&frame).map(Some),
            None => Ok(None),
        }
    }

    /// Lazily yields every message that is complete right now.
    pub fn messages(&mut self) -> Messages<'_> {
        Messages {
            buffer: self,
            failed: false,
        }
    }
}

pub struct Messages<'a> {
    buffer: &'a mut StreamBuffer,
    failed: bool,
}

impl Iterator for Messages<'_> {
    type Item = Result<StreamMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.buffer.next_message() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => None,
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
