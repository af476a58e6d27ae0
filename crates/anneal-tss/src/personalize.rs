//! Component personalization
//!
//! A raw firmware payload becomes device-acceptable by stitching it together
//! with the signed AP ticket from the ticket authority. image4-capable
//! devices get an IMG4 container (payload plus the `ApImg4Ticket` manifest);
//! legacy devices authenticate through the `APTicket` slot instead and take
//! the payload as stored.

use plist::Dictionary;
use thiserror::Error;
use tracing::debug;

use crate::response;

#[derive(Error, Debug)]
pub enum PersonalizeError {
    #[error("no ticket response available for '{0}'")]
    NoResponse(String),
    #[error("ticket response has no '{0}' for component '{1}'")]
    MissingSlot(&'static str, String),
}

/// DER header for a tag followed by `len` content bytes.
fn der_header(tag: u8, len: usize) -> Vec<u8> {
    let mut out = vec![tag];
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|&&b| b == 0).count();
        out.push(0x80 | (bytes.len() - skip) as u8);
        out.extend_from_slice(&bytes[skip..]);
    }
    out
}

fn der_ia5(s: &str) -> Vec<u8> {
    let mut out = der_header(0x16, s.len());
    out.extend_from_slice(s.as_bytes());
    out
}

/// Stitch an image4 container: `SEQUENCE { "IMG4", <payload>, [0] ticket }`.
/// The payload is embedded as stored in the archive.
fn stitch_image4(payload: &[u8], ticket: &[u8]) -> Vec<u8> {
    let mut context = der_header(0xa0, ticket.len());
    context.extend_from_slice(ticket);

    let magic = der_ia5("IMG4");
    let body_len = magic.len() + payload.len() + context.len();
    let mut out = der_header(0x30, body_len);
    out.reserve(body_len);
    out.extend_from_slice(&magic);
    out.extend_from_slice(payload);
    out.extend_from_slice(&context);
    out
}

/// Personalize `data` for upload.
///
/// `response` is the AP (or local-policy) ticket response; which ticket slot
/// is consulted follows the device's image4 capability.
pub fn personalize_component(
    component: &str,
    data: &[u8],
    response: Option<&Dictionary>,
    image4_supported: bool,
) -> Result<Vec<u8>, PersonalizeError> {
    let response =
        response.ok_or_else(|| PersonalizeError::NoResponse(component.to_string()))?;

    if image4_supported {
        let ticket = response::ap_img4_ticket(response).ok_or_else(|| {
            PersonalizeError::MissingSlot("ApImg4Ticket", component.to_string())
        })?;
        debug!(component, payload = data.len(), ticket = ticket.len(), "Stitching image4");
        Ok(stitch_image4(data, ticket))
    } else {
        // Legacy devices carry the AP ticket out of band; the payload is
        // uploaded as stored.
        response::ap_ticket(response).ok_or_else(|| {
            PersonalizeError::MissingSlot("APTicket", component.to_string())
        })?;
        debug!(component, payload = data.len(), "Legacy ticket slot verified");
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use plist::Value;

    fn response_with(key: &str, ticket: &[u8]) -> Dictionary {
        let mut dict = Dictionary::new();
        dict.insert(key.into(), Value::Data(ticket.to_vec()));
        dict
    }

    #[test]
    fn test_image4_stitch_layout() {
        let response = response_with("ApImg4Ticket", &[0xa5; 32]);
        let out = personalize_component("KernelCache", b"payload", Some(&response), true).unwrap();

        // outer SEQUENCE
        assert_eq!(out[0], 0x30);
        // contains the IMG4 magic string
        let magic_pos = out.windows(4).position(|w| w == b"IMG4").unwrap();
        assert_eq!(out[magic_pos - 2], 0x16);
        // payload embedded verbatim
        assert!(out.windows(7).any(|w| w == b"payload"));
        // ticket wrapped in a [0] context tag at the end
        let ticket_pos = out.windows(32).position(|w| w == [0xa5; 32]).unwrap();
        assert_eq!(out[ticket_pos - 2], 0xa0);
        assert_eq!(&out[out.len() - 32..], &[0xa5; 32][..]);
    }

    #[test]
    fn test_image4_requires_img4_slot() {
        let response = response_with("APTicket", &[1; 8]);
        let err =
            personalize_component("DeviceTree", b"x", Some(&response), true).unwrap_err();
        assert!(matches!(err, PersonalizeError::MissingSlot("ApImg4Ticket", _)));
    }

    #[test]
    fn test_legacy_slot_passthrough() {
        let response = response_with("APTicket", &[1; 8]);
        let out = personalize_component("KernelCache", b"raw", Some(&response), false).unwrap();
        assert_eq!(out, b"raw");
    }

    #[test]
    fn test_legacy_requires_ap_ticket_slot() {
        let response = response_with("ApImg4Ticket", &[1; 8]);
        let err = personalize_component("KernelCache", b"raw", Some(&response), false).unwrap_err();
        assert!(matches!(err, PersonalizeError::MissingSlot("APTicket", _)));
    }

    #[test]
    fn test_no_response_is_an_error() {
        let err = personalize_component("LLB", b"x", None, true).unwrap_err();
        assert!(matches!(err, PersonalizeError::NoResponse(_)));
    }

    #[test]
    fn test_long_form_der_lengths() {
        let response = response_with("ApImg4Ticket", &[0xee; 4]);
        let payload = vec![0x77u8; 300];
        let out = personalize_component("SEP", &payload, Some(&response), true).unwrap();
        // long-form length: 0x30 0x82 <hi> <lo>
        assert_eq!(out[0], 0x30);
        assert_eq!(out[1], 0x82);
        let body_len = ((out[2] as usize) << 8) | out[3] as usize;
        assert_eq!(body_len, out.len() - 4);
    }
}
