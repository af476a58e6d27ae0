//! MBN baseband module container
//!
//! A 40-byte little-endian header followed by the code image and a
//! signature region (signature + certificate chain). Re-signing replaces
//! the signature region with a per-device blob and fixes up the header.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

pub const MBN_HEADER_LEN: usize = 40;

#[derive(Error, Debug)]
pub enum MbnError {
    #[error("mbn file truncated: {0} bytes")]
    Truncated(usize),
    #[error("mbn header inconsistent: code ends at {code_end}, file is {len} bytes")]
    BadHeader { code_end: usize, len: usize },
}

/// Parsed MBN module. The backing buffer is kept in serialized form; field
/// updates rewrite it in place.
#[derive(Debug)]
pub struct MbnFile {
    data: Vec<u8>,
    code_size: usize,
}

impl MbnFile {
    pub fn parse(data: &[u8]) -> Result<Self, MbnError> {
        if data.len() < MBN_HEADER_LEN {
            return Err(MbnError::Truncated(data.len()));
        }
        let code_size = LittleEndian::read_u32(&data[20..24]) as usize;
        let code_end = MBN_HEADER_LEN + code_size;
        if code_end > data.len() {
            return Err(MbnError::BadHeader {
                code_end,
                len: data.len(),
            });
        }
        Ok(Self {
            data: data.to_vec(),
            code_size,
        })
    }

    pub fn code_size(&self) -> usize {
        self.code_size
    }

    pub fn signature_size(&self) -> usize {
        LittleEndian::read_u32(&self.data[28..32]) as usize
            + LittleEndian::read_u32(&self.data[36..40]) as usize
    }

    /// Replace the signature region with `blob` and fix up the header sizes.
    pub fn update_sig_blob(&mut self, blob: &[u8]) -> Result<(), MbnError> {
        let sig_start = MBN_HEADER_LEN + self.code_size;
        self.data.truncate(sig_start);
        self.data.extend_from_slice(blob);

        let image_size = (self.code_size + blob.len()) as u32;
        LittleEndian::write_u32(&mut self.data[16..20], image_size);
        LittleEndian::write_u32(&mut self.data[28..32], blob.len() as u32);
        LittleEndian::write_u32(&mut self.data[36..40], 0);
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_mbn(code: &[u8], sig: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; MBN_HEADER_LEN];
        LittleEndian::write_u32(&mut buf[0..4], 0x0005); // image id
        LittleEndian::write_u32(&mut buf[16..20], (code.len() + sig.len()) as u32);
        LittleEndian::write_u32(&mut buf[20..24], code.len() as u32);
        LittleEndian::write_u32(&mut buf[28..32], sig.len() as u32);
        buf.extend_from_slice(code);
        buf.extend_from_slice(sig);
        buf
    }

    #[test]
    fn test_parse_and_resign() {
        let raw = make_mbn(b"codecodecode", &[0x55; 16]);
        let mut mbn = MbnFile::parse(&raw).unwrap();
        assert_eq!(mbn.code_size(), 12);
        assert_eq!(mbn.signature_size(), 16);

        mbn.update_sig_blob(&[0xa5; 64]).unwrap();
        assert_eq!(mbn.size(), MBN_HEADER_LEN + 12 + 64);
        assert_eq!(&mbn.data()[MBN_HEADER_LEN + 12..], &[0xa5; 64][..]);

        // header sizes track the new blob
        let reparsed = MbnFile::parse(mbn.data()).unwrap();
        assert_eq!(reparsed.signature_size(), 64);
    }

    #[test]
    fn test_parse_rejects_truncated() {
        assert!(matches!(
            MbnFile::parse(&[0u8; 10]),
            Err(MbnError::Truncated(10))
        ));
    }

    #[test]
    fn test_parse_rejects_bad_code_size() {
        let mut raw = make_mbn(b"code", &[]);
        LittleEndian::write_u32(&mut raw[20..24], 4096);
        assert!(matches!(
            MbnFile::parse(&raw),
            Err(MbnError::BadHeader { .. })
        ));
    }
}
