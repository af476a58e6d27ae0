//! FLS baseband module container
//!
//! An FLS file is a sequence of tagged elements, each a little-endian
//! `(tag, total_length)` pair followed by its payload. Re-signing replaces
//! the signature element's payload; ticket installation adds or replaces a
//! ticket element.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

const ELEMENT_HEADER_LEN: usize = 8;

/// Element tags used by the restore pipeline.
pub const FLS_ELEMENT_CODE: u32 = 0x01;
pub const FLS_ELEMENT_SIGNATURE: u32 = 0x02;
pub const FLS_ELEMENT_TICKET: u32 = 0x03;

#[derive(Error, Debug)]
pub enum FlsError {
    #[error("fls element at offset {0} is truncated")]
    Truncated(usize),
    #[error("fls element at offset {offset} has bad length {len}")]
    BadElementLength { offset: usize, len: usize },
    #[error("fls file has no signature element")]
    NoSignature,
}

#[derive(Debug, Clone)]
struct FlsElement {
    tag: u32,
    payload: Vec<u8>,
}

/// Parsed FLS module.
#[derive(Debug)]
pub struct FlsFile {
    elements: Vec<FlsElement>,
}

impl FlsFile {
    pub fn parse(data: &[u8]) -> Result<Self, FlsError> {
        let mut elements = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            if data.len() - offset < ELEMENT_HEADER_LEN {
                return Err(FlsError::Truncated(offset));
            }
            let tag = LittleEndian::read_u32(&data[offset..offset + 4]);
            let len = LittleEndian::read_u32(&data[offset + 4..offset + 8]) as usize;
            if len < ELEMENT_HEADER_LEN || offset + len > data.len() {
                return Err(FlsError::BadElementLength { offset, len });
            }
            elements.push(FlsElement {
                tag,
                payload: data[offset + ELEMENT_HEADER_LEN..offset + len].to_vec(),
            });
            offset += len;
        }
        Ok(Self { elements })
    }

    fn element_mut(&mut self, tag: u32) -> Option<&mut FlsElement> {
        self.elements.iter_mut().find(|e| e.tag == tag)
    }

    pub fn element_payload(&self, tag: u32) -> Option<&[u8]> {
        self.elements
            .iter()
            .find(|e| e.tag == tag)
            .map(|e| e.payload.as_slice())
    }

    /// Replace the signature element's payload with `blob`.
    pub fn update_sig_blob(&mut self, blob: &[u8]) -> Result<(), FlsError> {
        let element = self
            .element_mut(FLS_ELEMENT_SIGNATURE)
            .ok_or(FlsError::NoSignature)?;
        element.payload = blob.to_vec();
        Ok(())
    }

    /// Install a baseband ticket, replacing any existing ticket element.
    pub fn insert_ticket(&mut self, ticket: &[u8]) -> Result<(), FlsError> {
        if let Some(element) = self.element_mut(FLS_ELEMENT_TICKET) {
            element.payload = ticket.to_vec();
        } else {
            self.elements.push(FlsElement {
                tag: FLS_ELEMENT_TICKET,
                payload: ticket.to_vec(),
            });
        }
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.elements
            .iter()
            .map(|e| ELEMENT_HEADER_LEN + e.payload.len())
            .sum()
    }

    /// Serialize back to the on-disk element sequence.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        for element in &self.elements {
            let mut header = [0u8; ELEMENT_HEADER_LEN];
            LittleEndian::write_u32(&mut header[0..4], element.tag);
            LittleEndian::write_u32(
                &mut header[4..8],
                (ELEMENT_HEADER_LEN + element.payload.len()) as u32,
            );
            out.extend_from_slice(&header);
            out.extend_from_slice(&element.payload);
        }
        out
    }
}
