use std::fmt;

use bytes::Bytes;

use crate::types::VariableType;

/// Raw register bytes paired with the type tag needed to interpret them.
/// All multi-byte values are little-endian on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterValue {
    pub var_type: VariableType,
    pub bytes: Bytes,
}

impl RegisterValue {
    pub fn new(var_type: VariableType, bytes: Bytes) -> Self {
        Self {
            var_type,
            bytes,
        }
    }

    /// Little-endian unsigned interpretation, up to 8 bytes.
    pub fn as_u64(&self) -> Option<u64> {
        if self.bytes.is_empty() || self.bytes.len() > 8 {
            return None;
        }
        let mut raw = [0u8; 8];
        raw[..self.bytes.len()].copy_from_slice(&self.bytes);
        Some(u64::from_le_bytes(raw))
    }

    /// Little-endian signed interpretation, sign-extended from the value
    /// width.
    pub fn as_i64(&self) -> Option<i64> {
        let unsigned = self.as_u64()?;
        let bits = self.bytes.len() * 8;
        if bits == 64 {
            return Some(unsigned as i64);
        }
        let sign = 1u64 << (bits - 1);
        if unsigned & sign != 0 {
            Some((unsigned | !(sign | (sign - 1))) as i64)
        } else {
            Some(unsigned as i64)
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.bytes.len() {
            4 => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&self.bytes);
                Some(f32::from_le_bytes(raw) as f64)
            }
            8 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.bytes);
                Some(f64::from_le_bytes(raw))
            }
            _ => None,
        }
    }

    fn hex(&self) -> String {
        self.bytes
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.var_type {
            VariableType::Bool => match self.bytes.first() {
                Some(0) => f.write_str("false"),
                Some(_) => f.write_str("true"),
                None => f.write_str(""),
            },
            VariableType::Char | VariableType::SChar | VariableType::Short
            | VariableType::Int | VariableType::Long => match self.as_i64() {
                Some(v) => write!(f, "{v}"),
                None => f.write_str(&self.hex()),
            },
            VariableType::UChar | VariableType::UShort | VariableType::UInt
            | VariableType::ULong | VariableType::Pointer | VariableType::TimeStamp => {
                match self.as_u64() {
                    Some(v) => write!(f, "{v}"),
                    None => f.write_str(&self.hex()),
                }
            }
            VariableType::Float | VariableType::Double | VariableType::LongDouble => {
                match self.as_f64() {
                    Some(v) => write!(f, "{v}"),
                    None => f.write_str(&self.hex()),
                }
            }
            VariableType::String => write!(f, "{}", String::from_utf8_lossy(&self.bytes)),
            VariableType::MemoryAlignment | VariableType::Blob | VariableType::Unknown => {
                f.write_str(&self.hex())
            }
        }
    }
}
