//! Fixed-layout body encoding shared by both protocol families.
//!
//! Bodies are plain serde structs run through bincode configured for
//! big-endian fixed-width integers, which reproduces the packed
//! network-order layouts byte for byte. Names travel as NUL-terminated,
//! zero-padded 10 byte fields.

use crate::{is_valid_name, Error, Result, UserRecord, NAME_FIELD_LENGTH};
use bincode::Options;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub type NameField = [u8; NAME_FIELD_LENGTH];

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

pub fn to_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(options().serialize(value)?)
}

/// Decodes a body that must occupy `bytes` exactly.
pub fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(options().deserialize(bytes)?)
}

/// Number of zero bytes needed to bring `length` to a 4 byte boundary.
pub fn padding_for(length: usize) -> usize {
    (4 - length % 4) % 4
}

pub fn padded_length(length: usize) -> usize {
    length + padding_for(length)
}

pub fn encode_name(name: &str) -> Result<NameField> {
    if !is_valid_name(name) {
        return Err(Error::malformed(format!("invalid player name {:?}", name)));
    }
    let mut field = [0u8; NAME_FIELD_LENGTH];
    field[..name.len()].copy_from_slice(name.as_bytes());
    Ok(field)
}

pub fn decode_name(field: &NameField) -> Result<String> {
    let end = field
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::malformed("name field is not NUL terminated"))?;
    let name = std::str::from_utf8(&field[..end])
        .map_err(|_| Error::malformed("name field is not ASCII"))?;
    if !is_valid_name(name) {
        return Err(Error::malformed(format!("invalid player name {:?}", name)));
    }
    Ok(name.to_string())
}

/// Appends `text`, its NUL terminator and zero padding to `out`.
pub fn put_text(out: &mut Vec<u8>, text: &str) {
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    let padding = padding_for(out.len());
    out.resize(out.len() + padding, 0);
}

/// Reads NUL-terminated text that fills `bytes` up to its padding.
pub fn take_text(bytes: &[u8]) -> Result<String> {
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Error::malformed("text is not NUL terminated"))?;
    if padded_length(end + 1) != bytes.len() {
        return Err(Error::malformed(format!(
            "text of {} bytes does not match payload of {} bytes",
            end,
            bytes.len()
        )));
    }
    std::str::from_utf8(&bytes[..end])
        .map(str::to_string)
        .map_err(|_| Error::malformed("text is not ASCII"))
}

/// Name, hp, exp, x, y: the 20 byte record used by login requests, logout
/// notifications, backups and join responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct RecordBody {
    name: NameField,
    hp: i32,
    exp: i32,
    x: u8,
    y: u8,
}

pub const RECORD_BODY_LENGTH: usize = NAME_FIELD_LENGTH + 10;

impl RecordBody {
    pub fn from_record(record: &UserRecord) -> Result<Self> {
        record.validate()?;
        Ok(Self {
            name: encode_name(&record.name)?,
            hp: record.hp,
            exp: record.exp,
            x: record.x,
            y: record.y,
        })
    }

    pub fn into_record(self) -> Result<UserRecord> {
        let record = UserRecord {
            name: decode_name(&self.name)?,
            hp: self.hp,
            exp: self.exp,
            x: self.x,
            y: self.y,
        };
        record.validate()?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding() {
        assert_eq!(padding_for(0), 0);
        assert_eq!(padding_for(1), 3);
        assert_eq!(padding_for(3), 1);
        assert_eq!(padding_for(4), 0);
        assert_eq!(padded_length(11), 12);
    }

    #[test]
    fn test_record_body_layout() {
        let record = UserRecord::new("alice", 0x0102_0304, 7, 10, 20);
        let bytes = to_bytes(&RecordBody::from_record(&record).unwrap()).unwrap();

        assert_eq!(bytes.len(), RECORD_BODY_LENGTH);
        assert_eq!(&bytes[..6], b"alice\0");
        assert_eq!(&bytes[10..14], &[1, 2, 3, 4]);
        assert_eq!(&bytes[14..18], &[0, 0, 0, 7]);
        assert_eq!(&bytes[18..], &[10, 20]);

        let body: RecordBody = from_bytes(&bytes).unwrap();
        assert_eq!(body.into_record().unwrap(), record);
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let record = UserRecord::new("bob", 1, 1, 1, 1);
        let mut bytes = to_bytes(&RecordBody::from_record(&record).unwrap()).unwrap();
        bytes.push(0);
        assert!(from_bytes::<RecordBody>(&bytes).is_err());
    }

    #[test]
    fn test_name_field_must_terminate() {
        let field = *b"abcdefghij";
        assert!(decode_name(&field).is_err());

        let mut field = [0u8; NAME_FIELD_LENGTH];
        assert!(decode_name(&field).is_err());
        field[0] = b'z';
        assert_eq!(decode_name(&field).unwrap(), "z");
    }

    #[test]
    fn test_text_padding() {
        let mut out = Vec::new();
        put_text(&mut out, "hey");
        assert_eq!(out, b"hey\0");

        let mut out = Vec::new();
        put_text(&mut out, "hello");
        assert_eq!(out, b"hello\0\0\0");
        assert_eq!(take_text(&out).unwrap(), "hello");

        assert!(take_text(b"hello\0\0\0\0\0\0\0").is_err());
        assert!(take_text(b"abcd").is_err());
    }
}
