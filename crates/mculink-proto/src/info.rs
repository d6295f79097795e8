//! Target info payload: the per-node variable-type size table.

use crate::error::{ProtoError, Result};
use crate::types::VariableType;

/// Separator between size records in an info payload.
pub const RECORD_SEPARATOR: u8 = 0x33;

/// One `(type, size)` entry of an info payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeRecord {
    pub var_type: VariableType,
    pub size: u32,
}

/// Parses the record-separated size table of an info response. Every
/// record is a type byte followed by one size byte, except `TimeStamp`
/// whose size is a little-endian u32 (the timestamp unit in µs).
pub fn parse_size_records(payload: &[u8]) -> Result<Vec<SizeRecord>> {
    if payload.len() < 2 {
        return Err(ProtoError::TooShort {
            message: "target info",
            need: 2,
            got: payload.len(),
        });
    }

    let mut records = Vec::new();
    for raw in payload.split(|&b| b == RECORD_SEPARATOR) {
        if raw.is_empty() {
            continue;
        }
        let var_type = VariableType::from_byte(raw[0]);
        let size = if var_type == VariableType::TimeStamp {
            if raw.len() < 5 {
                return Err(ProtoError::MalformedSizeRecord);
            }
            u32::from_le_bytes([raw[1], raw[2], raw[3], raw[4]])
        } else {
            if raw.len() < 2 {
                return Err(ProtoError::MalformedSizeRecord);
            }
            u32::from(raw[1])
        };
        records.push(SizeRecord {
            var_type,
            size,
        });
    }
    Ok(records)
}

/// Builds the wire payload for a size table, the device-side counterpart
/// of [`parse_size_records`].
pub fn encode_size_records(records: &[SizeRecord]) -> Vec<u8> {
    let mut payload = Vec::new();
    for (i, record) in records.iter().enumerate() {
        if i > 0 {
            payload.push(RECORD_SEPARATOR);
        }
        payload.push(record.var_type.as_byte());
        if record.var_type == VariableType::TimeStamp {
            payload.extend_from_slice(&record.size.to_le_bytes());
        } else {
            payload.push(record.size as u8);
        }
    }
    payload
}
