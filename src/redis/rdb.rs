use std::{
    fs,
    path::Path,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bytes::Bytes;

// Section opcodes of the snapshot format.
const OP_AUX: u8 = 0xFA;
const OP_RESIZEDB: u8 = 0xFB;
const OP_EXPIRE_MS: u8 = 0xFC;
const OP_EXPIRE_SECS: u8 = 0xFD;
const OP_SELECTDB: u8 = 0xFE;
const OP_EOF: u8 = 0xFF;

const TYPE_STRING: u8 = 0x00;

const HEADER_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdbEntry {
    pub key: Bytes,
    pub value: Bytes,
    /// Absolute expiry carried verbatim from the snapshot; may already be in
    /// the past. Purging is the store's job, not the decoder's.
    pub expires_at: Option<SystemTime>,
}

/// Loads and decodes the snapshot at `path`. A missing or unreadable file is
/// an empty snapshot.
pub fn load(path: &Path) -> Vec<RdbEntry> {
    match fs::read(path) {
        Ok(bytes) => decode(&bytes),
        Err(err) => {
            log::debug!("no snapshot at {}: {err}", path.display());
            Vec::new()
        }
    }
}

/// Decodes the snapshot byte stream: a 9-byte header, opcode-introduced
/// sections, and type-0 string entries with optional absolute expiries.
///
/// Decoding is best-effort: an unknown opcode, an unsupported value type, or
/// a truncated entry stops the scan, and everything decoded up to that point
/// is returned.
pub fn decode(buf: &[u8]) -> Vec<RdbEntry> {
    let mut cursor = Cursor { buf, pos: 0 };
    let mut entries = Vec::new();

    if cursor.take(HEADER_LEN).is_none() {
        log::warn!("snapshot is shorter than its header; ignoring it");
        return entries;
    }

    loop {
        let Some(op) = cursor.u8() else { break };
        let complete = match op {
            OP_EOF => break,
            OP_AUX => cursor.short_string().is_some() && cursor.short_string().is_some(),
            // Database index byte plus a 4-byte resize hint, both ignored.
            OP_SELECTDB => cursor.take(5).is_some(),
            // Hash-table size hints, ignored.
            OP_RESIZEDB => cursor.take(2).is_some(),
            OP_EXPIRE_SECS => match cursor.u32_le() {
                Some(secs) => {
                    let expires_at = UNIX_EPOCH + Duration::from_secs(u64::from(secs));
                    read_typed_entry(&mut cursor, Some(expires_at), &mut entries)
                }
                None => false,
            },
            OP_EXPIRE_MS => match cursor.u64_le() {
                Some(millis) => {
                    let expires_at = UNIX_EPOCH + Duration::from_millis(millis);
                    read_typed_entry(&mut cursor, Some(expires_at), &mut entries)
                }
                None => false,
            },
            TYPE_STRING => read_string_entry(&mut cursor, None, &mut entries),
            other => {
                log::warn!(
                    "unsupported snapshot opcode {other:#04x}; keeping the {} entries decoded so far",
                    entries.len()
                );
                break;
            }
        };

        if !complete {
            log::warn!(
                "snapshot truncated mid-entry; keeping the {} entries decoded so far",
                entries.len()
            );
            break;
        }
    }

    entries
}

fn read_typed_entry(
    cursor: &mut Cursor<'_>,
    expires_at: Option<SystemTime>,
    entries: &mut Vec<RdbEntry>,
) -> bool {
    match cursor.u8() {
        Some(TYPE_STRING) => read_string_entry(cursor, expires_at, entries),
        Some(other) => {
            log::warn!("unsupported snapshot value type {other:#04x}");
            false
        }
        None => false,
    }
}

fn read_string_entry(
    cursor: &mut Cursor<'_>,
    expires_at: Option<SystemTime>,
    entries: &mut Vec<RdbEntry>,
) -> bool {
    let Some(key) = cursor.short_string() else {
        return false;
    };
    let Some(value) = cursor.short_string() else {
        return false;
    };

    entries.push(RdbEntry {
        key: Bytes::copy_from_slice(key),
        value: Bytes::copy_from_slice(value),
        expires_at,
    });
    true
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let bytes = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(bytes)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|bytes| bytes[0])
    }

    fn u32_le(&mut self) -> Option<u32> {
        let bytes = self.take(4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64_le(&mut self) -> Option<u64> {
        let bytes = self.take(8)?;
        Some(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    /// Short-form string: a single length byte followed by that many bytes.
    fn short_string(&mut self) -> Option<&'a [u8]> {
        let length = self.u8()? as usize;
        self.take(length)
    }
}
