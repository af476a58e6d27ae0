//! Tagged firmware tables (ftab)
//!
//! RTKit co-processor payloads ship as an ftab: a 32-byte header carrying a
//! four-byte container tag and an entry count, an entry table of
//! `(tag, offset, size)` rows, then the entry payloads. The restore driver
//! composes a boot ftab by copying the recovery entry (`rrko`) from the
//! companion recovery table into the base table.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

const HEADER_LEN: usize = 32;
const ENTRY_LEN: usize = 16;

/// Container tag expected on boot-RTKit payloads.
pub const RTKIT_OS_TAG: [u8; 4] = *b"rkos";
/// Entry tag of the recovery RTKit OS image.
pub const RECOVERY_OS_ENTRY: [u8; 4] = *b"rrko";

#[derive(Error, Debug)]
pub enum FtabError {
    #[error("ftab truncated: {0} bytes")]
    Truncated(usize),
    #[error("ftab entry {index} out of bounds (offset {offset}, size {size})")]
    EntryOutOfBounds { index: usize, offset: usize, size: usize },
}

#[derive(Debug, Clone)]
struct FtabEntry {
    tag: [u8; 4],
    data: Vec<u8>,
}

/// Parsed firmware table, indexable by entry tag.
#[derive(Debug)]
pub struct Ftab {
    container_tag: [u8; 4],
    entries: Vec<FtabEntry>,
}

/// Render a four-byte tag for log output.
pub fn fourcc(tag: [u8; 4]) -> String {
    tag.iter()
        .map(|&b| {
            if b.is_ascii_graphic() {
                (b as char).to_string()
            } else {
                format!("\\x{b:02x}")
            }
        })
        .collect()
}

impl Ftab {
    pub fn parse(data: &[u8]) -> Result<Self, FtabError> {
        if data.len() < HEADER_LEN {
            return Err(FtabError::Truncated(data.len()));
        }
        let mut container_tag = [0u8; 4];
        container_tag.copy_from_slice(&data[16..20]);
        let num_entries = LittleEndian::read_u32(&data[24..28]) as usize;

        let table_end = HEADER_LEN + num_entries * ENTRY_LEN;
        if table_end > data.len() {
            return Err(FtabError::Truncated(data.len()));
        }

        let mut entries = Vec::with_capacity(num_entries);
        for index in 0..num_entries {
            let row = HEADER_LEN + index * ENTRY_LEN;
            let mut tag = [0u8; 4];
            tag.copy_from_slice(&data[row..row + 4]);
            let offset = LittleEndian::read_u32(&data[row + 4..row + 8]) as usize;
            let size = LittleEndian::read_u32(&data[row + 8..row + 12]) as usize;
            if offset + size > data.len() {
                return Err(FtabError::EntryOutOfBounds { index, offset, size });
            }
            entries.push(FtabEntry {
                tag,
                data: data[offset..offset + size].to_vec(),
            });
        }

        Ok(Self {
            container_tag,
            entries,
        })
    }

    pub fn container_tag(&self) -> [u8; 4] {
        self.container_tag
    }

    pub fn entry(&self, tag: [u8; 4]) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.tag == tag)
            .map(|e| e.data.as_slice())
    }

    /// Append an entry, replacing any existing entry with the same tag.
    pub fn set_entry(&mut self, tag: [u8; 4], data: &[u8]) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.tag == tag) {
            entry.data = data.to_vec();
        } else {
            self.entries.push(FtabEntry {
                tag,
                data: data.to_vec(),
            });
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Serialize the table, recomputing entry offsets.
    pub fn to_bytes(&self) -> Vec<u8> {
        let table_end = HEADER_LEN + self.entries.len() * ENTRY_LEN;
        let payload_len: usize = self.entries.iter().map(|e| e.data.len()).sum();
        let mut out = vec![0u8; table_end];

        LittleEndian::write_u32(&mut out[0..4], 1);
        LittleEndian::write_u32(&mut out[4..8], u32::MAX);
        out[16..20].copy_from_slice(&self.container_tag);
        LittleEndian::write_u32(&mut out[24..28], self.entries.len() as u32);

        out.reserve(payload_len);
        let mut offset = table_end;
        for (index, entry) in self.entries.iter().enumerate() {
            let row = HEADER_LEN + index * ENTRY_LEN;
            out[row..row + 4].copy_from_slice(&entry.tag);
            LittleEndian::write_u32(&mut out[row + 4..row + 8], offset as u32);
            LittleEndian::write_u32(&mut out[row + 8..row + 12], entry.data.len() as u32);
            offset += entry.data.len();
        }
        for entry in &self.entries {
            out.extend_from_slice(&entry.data);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ftab(tag: [u8; 4], entries: &[([u8; 4], &[u8])]) -> Vec<u8> {
        let mut ftab = Ftab {
            container_tag: tag,
            entries: Vec::new(),
        };
        for (etag, data) in entries {
            ftab.set_entry(*etag, data);
        }
        ftab.to_bytes()
    }

    #[test]
    fn test_parse_round_trip() {
        let raw = make_ftab(RTKIT_OS_TAG, &[(*b"rkos", b"main-os"), (*b"aopf", b"aop")]);
        let ftab = Ftab::parse(&raw).unwrap();
        assert_eq!(ftab.container_tag(), RTKIT_OS_TAG);
        assert_eq!(ftab.entry_count(), 2);
        assert_eq!(ftab.entry(*b"rkos"), Some(&b"main-os"[..]));
        assert_eq!(ftab.entry(*b"aopf"), Some(&b"aop"[..]));
        assert_eq!(ftab.entry(*b"none"), None);
        assert_eq!(ftab.to_bytes(), raw);
    }

    #[test]
    fn test_recovery_entry_composition() {
        let base = make_ftab(RTKIT_OS_TAG, &[(*b"rkos", b"main-os")]);
        let recovery = make_ftab(RTKIT_OS_TAG, &[(RECOVERY_OS_ENTRY, b"recovery-os")]);

        let mut base = Ftab::parse(&base).unwrap();
        let recovery = Ftab::parse(&recovery).unwrap();
        let rrko = recovery.entry(RECOVERY_OS_ENTRY).unwrap();
        base.set_entry(RECOVERY_OS_ENTRY, rrko);

        let composed = Ftab::parse(&base.to_bytes()).unwrap();
        assert_eq!(composed.entry_count(), 2);
        assert_eq!(composed.entry(RECOVERY_OS_ENTRY), Some(&b"recovery-os"[..]));
        assert_eq!(composed.entry(*b"rkos"), Some(&b"main-os"[..]));
    }

    #[test]
    fn test_set_entry_replaces() {
        let raw = make_ftab(RTKIT_OS_TAG, &[(*b"rkos", b"one")]);
        let mut ftab = Ftab::parse(&raw).unwrap();
        ftab.set_entry(*b"rkos", b"two");
        assert_eq!(ftab.entry_count(), 1);
        assert_eq!(ftab.entry(*b"rkos"), Some(&b"two"[..]));
    }

    #[test]
    fn test_parse_rejects_out_of_bounds_entry() {
        let mut raw = make_ftab(RTKIT_OS_TAG, &[(*b"rkos", b"abc")]);
        // corrupt the entry size
        let row = HEADER_LEN;
        LittleEndian::write_u32(&mut raw[row + 8..row + 12], 4096);
        assert!(matches!(
            Ftab::parse(&raw),
            Err(FtabError::EntryOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_fourcc_rendering() {
        assert_eq!(fourcc(*b"rkos"), "rkos");
        assert_eq!(fourcc([0x00, b'a', b'b', b'c']), "\\x00abc");
    }
}
