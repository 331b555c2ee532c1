//! Binary framing for stored entries.
//!
//! Format:
//! ```text
//! [magic: 4 bytes "KYLC"][version: 1 byte][key len: 2 bytes LE][value len: 4 bytes LE]
//! [key: K bytes UTF-8][value: V bytes][crc32 of everything before: 4 bytes LE]
//! ```

use std::io::{Error as IoError, ErrorKind, Result as IoResult};

use crc32fast::Hasher;

const CODEC_VERSION: u8 = 1;

/// Magic bytes identifying a kyrologic cache entry.
pub const MAGIC: [u8; 4] = *b"KYLC";

const HEADER_LEN: usize = 4 + 1 + 2 + 4;
const MAX_VALUE_SIZE: usize = 64 * 1024 * 1024;

fn invalid(message: String) -> IoError {
    IoError::new(ErrorKind::InvalidData, message)
}

/// Frames `key` and `value` with a checksum.
pub fn encode(key: &str, value: &[u8]) -> IoResult<Vec<u8>> {
    let key_len = u16::try_from(key.len()).map_err(|_| invalid(format!("key of {} bytes is too long", key.len())))?;
    if value.len() > MAX_VALUE_SIZE {
        return Err(invalid(format!(
            "value size {} exceeds maximum {MAX_VALUE_SIZE}",
            value.len()
        )));
    }
    let value_len = u32::try_from(value.len()).map_err(|_| invalid("value too large".to_string()))?;

    let mut out = Vec::with_capacity(HEADER_LEN + key.len() + value.len() + 4);
    out.extend_from_slice(&MAGIC);
    out.push(CODEC_VERSION);
    out.extend_from_slice(&key_len.to_le_bytes());
    out.extend_from_slice(&value_len.to_le_bytes());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(value);

    let mut hasher = Hasher::new();
    hasher.update(&out);
    out.extend_from_slice(&hasher.finalize().to_le_bytes());
    Ok(out)
}

/// Unframes an entry, verifying magic, version, lengths, and checksum.
pub fn decode(bytes: &[u8]) -> IoResult<(String, Vec<u8>)> {
    if bytes.len() < HEADER_LEN + 4 {
        return Err(invalid(format!("entry of {} bytes is truncated", bytes.len())));
    }
    if bytes[..4] != MAGIC {
        return Err(invalid(format!("invalid magic bytes: {:?}", &bytes[..4])));
    }
    if bytes[4] != CODEC_VERSION {
        return Err(invalid(format!(
            "unsupported codec version: {} (expected {CODEC_VERSION})",
            bytes[4]
        )));
    }
    let key_len = usize::from(u16::from_le_bytes([bytes[5], bytes[6]]));
    let value_len = u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]) as usize;
    if value_len > MAX_VALUE_SIZE {
        return Err(invalid(format!("entry size {value_len} exceeds maximum {MAX_VALUE_SIZE}")));
    }
    let body_end = HEADER_LEN + key_len + value_len;
    if bytes.len() != body_end + 4 {
        return Err(invalid(format!(
            "length mismatch: header says {} bytes, file has {}",
            body_end + 4,
            bytes.len()
        )));
    }

    let stored_crc = u32::from_le_bytes([
        bytes[body_end],
        bytes[body_end + 1],
        bytes[body_end + 2],
        bytes[body_end + 3],
    ]);
    let mut hasher = Hasher::new();
    hasher.update(&bytes[..body_end]);
    let computed_crc = hasher.finalize();
    if stored_crc != computed_crc {
        return Err(invalid(format!(
            "CRC mismatch: stored={stored_crc:08x}, computed={computed_crc:08x} (data corrupted)"
        )));
    }

    let key = std::str::from_utf8(&bytes[HEADER_LEN..HEADER_LEN + key_len])
        .map_err(|e| invalid(format!("key is not UTF-8: {e}")))?
        .to_string();
    Ok((key, bytes[HEADER_LEN + key_len..body_end].to_vec()))
}
