//! Datagram protocol: directory, location and persistence traffic over UDP.
//!
//! A datagram is a 5 byte header (`msg_type`, `sequence_id`) followed by a
//! fixed-layout body. Unlike stream frames there is no length field: one
//! packet is one message.

use crate::wire::{decode_name, encode_name, from_bytes, to_bytes, NameField};
use crate::world::Area;
use crate::{Error, Result, UserRecord, MAX_PACKET_LENGTH};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};

pub const DATAGRAM_HEADER_LENGTH: usize = 5;
pub const MAX_UDP_MESSAGE: u8 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatagramKind {
    StorageLocationRequest = 0,
    StorageLocationResponse = 1,
    ServerAreaRequest = 2,
    ServerAreaResponse = 3,
    PlayerStateRequest = 4,
    PlayerStateResponse = 5,
    SaveStateRequest = 6,
    SaveStateResponse = 7,
}

impl DatagramKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        use DatagramKind::*;
        let kind = match value {
            0 => StorageLocationRequest,
            1 => StorageLocationResponse,
            2 => ServerAreaRequest,
            3 => ServerAreaResponse,
            4 => PlayerStateRequest,
            5 => PlayerStateResponse,
            6 => SaveStateRequest,
            7 => SaveStateResponse,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DatagramHeader {
    msg_type: u8,
    sequence_id: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct NameBody {
    name: NameField,
    padding: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct StorageLocationBody {
    ip: u32,
    udp_port: u16,
    padding: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct AreaRequestBody {
    x: u8,
    y: u8,
    padding: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct AreaResponseBody {
    ip: u32,
    tcp_port: u16,
    min_x: u8,
    max_x: u8,
    min_y: u8,
    max_y: u8,
    padding: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct PlayerStateBody {
    name: NameField,
    hp: i32,
    exp: i32,
    x: u8,
    y: u8,
    padding: [u8; 3],
}

impl PlayerStateBody {
    fn from_record(record: &UserRecord) -> Result<Self> {
        record.validate()?;
        Ok(Self {
            name: encode_name(&record.name)?,
            hp: record.hp,
            exp: record.exp,
            x: record.x,
            y: record.y,
            padding: [0; 3],
        })
    }

    fn into_record(self) -> Result<UserRecord> {
        let record = UserRecord::new(decode_name(&self.name)?, self.hp, self.exp, self.x, self.y);
        record.validate()?;
        Ok(record)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SaveStateResponseBody {
    error_code: u8,
    padding: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpMessage {
    StorageLocationRequest {
        name: String,
    },
    StorageLocationResponse {
        ip: Ipv4Addr,
        udp_port: u16,
    },
    ServerAreaRequest {
        x: u8,
        y: u8,
    },
    ServerAreaResponse {
        ip: Ipv4Addr,
        tcp_port: u16,
        area: Area,
    },
    PlayerStateRequest {
        name: String,
    },
    PlayerStateResponse(UserRecord),
    SaveStateRequest(UserRecord),
    SaveStateResponse {
        error_code: u8,
    },
}

impl UdpMessage {
    pub fn kind(&self) -> DatagramKind {
        match self {
            UdpMessage::StorageLocationRequest { .. } => DatagramKind::StorageLocationRequest,
            UdpMessage::StorageLocationResponse { .. } => DatagramKind::StorageLocationResponse,
            UdpMessage::ServerAreaRequest { .. } => DatagramKind::ServerAreaRequest,
            UdpMessage::ServerAreaResponse { .. } => DatagramKind::ServerAreaResponse,
            UdpMessage::PlayerStateRequest { .. } => DatagramKind::PlayerStateRequest,
            UdpMessage::PlayerStateResponse(_) => DatagramKind::PlayerStateResponse,
            UdpMessage::SaveStateRequest(_) => DatagramKind::SaveStateRequest,
            UdpMessage::SaveStateResponse { .. } => DatagramKind::SaveStateResponse,
        }
    }

    /// Encodes the message as one packet stamped with `sequence_id`.
    pub fn encode(&self, sequence_id: u32) -> Result<Vec<u8>> {
        let mut packet = to_bytes(&DatagramHeader {
            msg_type: self.kind() as u8,
            sequence_id,
        })?;
        let body = match self {
            UdpMessage::StorageLocationRequest { name } | UdpMessage::PlayerStateRequest { name } => {
                to_bytes(&NameBody {
                    name: encode_name(name)?,
                    padding: 0,
                })?
            }
            UdpMessage::StorageLocationResponse { ip, udp_port } => to_bytes(&StorageLocationBody {
                ip: u32::from(*ip),
                udp_port: *udp_port,
                padding: 0,
            })?,
            UdpMessage::ServerAreaRequest { x, y } => to_bytes(&AreaRequestBody {
                x: *x,
                y: *y,
                padding: 0,
            })?,
            UdpMessage::ServerAreaResponse { ip, tcp_port, area } => to_bytes(&AreaResponseBody {
                ip: u32::from(*ip),
                tcp_port: *tcp_port,
                min_x: area.min_x,
                max_x: area.max_x,
                min_y: area.min_y,
                max_y: area.max_y,
                padding: 0,
            })?,
            UdpMessage::PlayerStateResponse(record) | UdpMessage::SaveStateRequest(record) => {
                to_bytes(&PlayerStateBody::from_record(record)?)?
            }
            UdpMessage::SaveStateResponse { error_code } => to_bytes(&SaveStateResponseBody {
                error_code: *error_code,
                padding: 0,
            })?,
        };
        packet.extend(body);
        Ok(packet)
    }

    fn decode(kind: DatagramKind, body: &[u8]) -> Result<UdpMessage> {
        let message = match kind {
            DatagramKind::StorageLocationRequest => UdpMessage::StorageLocationRequest {
                name: decode_name(&from_bytes::<NameBody>(body)?.name)?,
            },
            DatagramKind::PlayerStateRequest => UdpMessage::PlayerStateRequest {
                name: decode_name(&from_bytes::<NameBody>(body)?.name)?,
            },
            DatagramKind::StorageLocationResponse => {
                let body: StorageLocationBody = from_bytes(body)?;
                UdpMessage::StorageLocationResponse {
                    ip: Ipv4Addr::from(body.ip),
                    udp_port: body.udp_port,
                }
            }
            DatagramKind::ServerAreaRequest => {
                let body: AreaRequestBody = from_bytes(body)?;
                UdpMessage::ServerAreaRequest {
                    x: body.x,
                    y: body.y,
                }
            }
            DatagramKind::ServerAreaResponse => {
                let body: AreaResponseBody = from_bytes(body)?;
                let area = Area {
                    min_x: body.min_x,
                    max_x: body.max_x,
                    min_y: body.min_y,
                    max_y: body.max_y,
                };
                if !area.is_valid() {
                    return Err(Error::malformed(format!("invalid server area {}", area)));
                }
                UdpMessage::ServerAreaResponse {
                    ip: Ipv4Addr::from(body.ip),
                    tcp_port: body.tcp_port,
                    area,
                }
            }
            DatagramKind::PlayerStateResponse => {
                UdpMessage::PlayerStateResponse(from_bytes::<PlayerStateBody>(body)?.into_record()?)
            }
            DatagramKind::SaveStateRequest => {
                UdpMessage::SaveStateRequest(from_bytes::<PlayerStateBody>(body)?.into_record()?)
            }
            DatagramKind::SaveStateResponse => UdpMessage::SaveStateResponse {
                error_code: from_bytes::<SaveStateResponseBody>(body)?.error_code,
            },
        };
        Ok(message)
    }
}

/// A received packet whose header has been validated.
///
/// The body stays raw until a handler asks for it, so that an engine can
/// correlate and deduplicate without understanding every message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub source: SocketAddr,
    pub sequence_id: u32,
    pub kind: DatagramKind,
    pub payload: Vec<u8>,
}

impl Datagram {
    pub fn parse(bytes: &[u8], source: SocketAddr) -> Result<Datagram> {
        if bytes.len() < DATAGRAM_HEADER_LENGTH || bytes.len() > MAX_PACKET_LENGTH {
            return Err(Error::malformed(format!(
                "datagram of {} bytes from {}",
                bytes.len(),
                source
            )));
        }
        if bytes.len() % 4 != 0 {
            return Err(Error::malformed(format!(
                "unaligned datagram of {} bytes from {}",
                bytes.len(),
                source
            )));
        }
        let header: DatagramHeader = from_bytes(&bytes[..DATAGRAM_HEADER_LENGTH])?;
        let kind = DatagramKind::from_u8(header.msg_type).ok_or_else(|| {
            Error::malformed(format!(
                "datagram type {} from {} is out of range",
                header.msg_type, source
            ))
        })?;
        Ok(Datagram {
            source,
            sequence_id: header.sequence_id,
            kind,
            payload: bytes[DATAGRAM_HEADER_LENGTH..].to_vec(),
        })
    }

    pub fn message(&self) -> Result<UdpMessage> {
        UdpMessage::decode(self.kind, &self.payload)
    }
}
