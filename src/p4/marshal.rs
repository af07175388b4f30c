//! Decoder for the self-describing record stream emitted by the depot
//! client in structured-output mode (`-G`).
//!
//! The wire format is a sequence of serialized dictionaries: `{` opens a
//! dictionary, followed by alternating key/value objects, terminated by
//! `0`. Strings are `s` plus a 32-bit little-endian length plus raw
//! bytes (`u` is the same layout); integers are `i` plus a 32-bit
//! little-endian value. Keys are always strings; values are strings or
//! integers. The stream ends at EOF on a record boundary.

use std::collections::BTreeMap;
use std::io::{self, Read};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Bytes(Vec<u8>),
    Int(i64),
}

impl Value {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            Value::Int(_) => None,
        }
    }
}

/// One decoded record. Values stay as raw bytes; only the accessors
/// decode, because `data` and description fields may carry arbitrary or
/// non-UTF-8 content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record(pub BTreeMap<String, Value>);

impl Record {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        self.0.get(key).and_then(Value::as_bytes)
    }

    /// Lossy text view of a field.
    pub fn text(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
            Value::Int(i) => Some(i.to_string()),
        }
    }

    /// Numeric view; depot servers report most numbers as decimal
    /// strings.
    pub fn int(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Int(i) => Some(*i),
            Value::Bytes(b) => std::str::from_utf8(b).ok()?.trim().parse().ok(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Convenience for the `code` field present on status records.
    pub fn code(&self) -> Option<String> {
        self.text("code")
    }

    pub fn is_error(&self) -> bool {
        self.code().as_deref() == Some("error")
    }

    pub fn is_info(&self) -> bool {
        self.code().as_deref() == Some("info")
    }

    /// Build a record from string fields; handy for tests and for
    /// synthesizing form input.
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), Value::Bytes(v.as_bytes().to_vec()));
        }
        Record(map)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("record stream i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("unexpected type marker {marker:#04x} in record stream")]
    BadMarker { marker: u8 },
    #[error("record key is not a string")]
    NonStringKey,
    #[error("truncated record stream")]
    Truncated,
}

fn read_u8(reader: &mut impl Read) -> Result<Option<u8>, DecodeError> {
    let mut buf = [0u8; 1];
    match reader.read(&mut buf)? {
        0 => Ok(None),
        _ => Ok(Some(buf[0])),
    }
}

fn read_u32(reader: &mut impl Read) -> Result<u32, DecodeError> {
    let mut buf = [0u8; 4];
    reader
        .read_exact(&mut buf)
        .map_err(|_| DecodeError::Truncated)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_value(reader: &mut impl Read, marker: u8) -> Result<Value, DecodeError> {
    match marker {
        b's' | b'u' => {
            let len = read_u32(reader)? as usize;
            let mut data = vec![0u8; len];
            reader
                .read_exact(&mut data)
                .map_err(|_| DecodeError::Truncated)?;
            Ok(Value::Bytes(data))
        }
        b'i' => {
            let raw = read_u32(reader)?;
            Ok(Value::Int(raw as i32 as i64))
        }
        other => Err(DecodeError::BadMarker { marker: other }),
    }
}

/// Decode the next record, or `None` on clean end-of-stream.
pub fn read_record(reader: &mut impl Read) -> Result<Option<Record>, DecodeError> {
    let marker = match read_u8(reader)? {
        None => return Ok(None),
        Some(m) => m,
    };
    if marker != b'{' {
        return Err(DecodeError::BadMarker { marker });
    }

    let mut map = BTreeMap::new();
    loop {
        let key_marker = read_u8(reader)?.ok_or(DecodeError::Truncated)?;
        if key_marker == b'0' {
            return Ok(Some(Record(map)));
        }
        let key = match read_value(reader, key_marker)? {
            Value::Bytes(b) => String::from_utf8_lossy(&b).into_owned(),
            Value::Int(_) => return Err(DecodeError::NonStringKey),
        };
        let val_marker = read_u8(reader)?.ok_or(DecodeError::Truncated)?;
        let value = read_value(reader, val_marker)?;
        map.insert(key, value);
    }
}

/// Drain a whole stream into a vector of records.
pub fn read_all(reader: &mut impl Read) -> Result<Vec<Record>, DecodeError> {
    let mut records = Vec::new();
    while let Some(record) = read_record(reader)? {
        records.push(record);
    }
    Ok(records)
}

/// Encode a record for tests and for feeding record-mode input back to
/// the client (`-i` forms).
pub fn write_record(out: &mut Vec<u8>, record: &Record) {
    out.push(b'{');
    for (key, value) in &record.0 {
        out.push(b's');
        out.extend_from_slice(&(key.len() as u32).to_le_bytes());
        out.extend_from_slice(key.as_bytes());
        match value {
            Value::Bytes(b) => {
                out.push(b's');
                out.extend_from_slice(&(b.len() as u32).to_le_bytes());
                out.extend_from_slice(b);
            }
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(&(*i as i32).to_le_bytes());
            }
        }
    }
    out.push(b'0');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(pairs: &[(&str, Value)]) -> Vec<u8> {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        let mut out = Vec::new();
        write_record(&mut out, &Record(map));
        out
    }

    #[test]
    fn round_trips_strings_and_ints() {
        let encoded = encode(&[
            ("change", Value::Bytes(b"42".to_vec())),
            ("jobTotal", Value::Int(3)),
        ]);
        let mut cursor = std::io::Cursor::new(encoded);
        let record = read_record(&mut cursor).unwrap().unwrap();
        assert_eq!(record.int("change"), Some(42));
        assert_eq!(record.int("jobTotal"), Some(3));
        assert!(read_record(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn stops_cleanly_at_eof() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        assert!(read_record(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn multiple_records_in_sequence() {
        let mut bytes = encode(&[("code", Value::Bytes(b"stat".to_vec()))]);
        bytes.extend(encode(&[("code", Value::Bytes(b"error".to_vec()))]));
        let mut cursor = std::io::Cursor::new(bytes);
        let records = read_all(&mut cursor).unwrap();
        assert_eq!(records.len(), 2);
        assert!(!records[0].is_error());
        assert!(records[1].is_error());
    }

    #[test]
    fn truncated_record_is_an_error() {
        let mut bytes = encode(&[("code", Value::Bytes(b"stat".to_vec()))]);
        bytes.truncate(bytes.len() - 3);
        let mut cursor = std::io::Cursor::new(bytes);
        assert!(read_record(&mut cursor).is_err());
    }

    #[test]
    fn negative_ints_survive() {
        let encoded = encode(&[("delta", Value::Int(-7))]);
        let mut cursor = std::io::Cursor::new(encoded);
        let record = read_record(&mut cursor).unwrap().unwrap();
        assert_eq!(record.int("delta"), Some(-7));
    }
}
