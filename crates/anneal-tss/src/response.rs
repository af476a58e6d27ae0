//! Ticket response accessors
//!
//! Responses are plist dictionaries keyed by subsystem ticket names. The
//! driver mostly needs to confirm a ticket's presence, pull ticket bytes
//! for personalization, and honor per-entry path overrides.

use plist::{Dictionary, Value};

/// The image4 AP ticket (`ApImg4Ticket`).
pub fn ap_img4_ticket(response: &Dictionary) -> Option<&[u8]> {
    response.get("ApImg4Ticket").and_then(Value::as_data)
}

/// The legacy AP ticket (`APTicket`).
pub fn ap_ticket(response: &Dictionary) -> Option<&[u8]> {
    response.get("APTicket").and_then(Value::as_data)
}

/// The baseband ticket (`BBTicket`).
pub fn bb_ticket(response: &Dictionary) -> Option<&[u8]> {
    response.get("BBTicket").and_then(Value::as_data)
}

/// Whether a response carries `key` at all.
pub fn has_ticket(response: &Dictionary, key: &str) -> bool {
    response.contains_key(key)
}

/// Per-entry path override: `response.<component>.Path`, when the ticket
/// authority pinned a specific archive path for a component.
pub fn path_for_entry<'a>(response: &'a Dictionary, component: &str) -> Option<&'a str> {
    response
        .get(component)
        .and_then(Value::as_dictionary)
        .and_then(|entry| entry.get("Path"))
        .and_then(Value::as_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticket_accessors() {
        let mut response = Dictionary::new();
        response.insert("ApImg4Ticket".into(), Value::Data(vec![0xa5; 4]));
        response.insert("BBTicket".into(), Value::Data(vec![0xbb; 4]));

        assert_eq!(ap_img4_ticket(&response), Some(&[0xa5; 4][..]));
        assert_eq!(bb_ticket(&response), Some(&[0xbb; 4][..]));
        assert_eq!(ap_ticket(&response), None);
        assert!(has_ticket(&response, "BBTicket"));
        assert!(!has_ticket(&response, "SE,Ticket"));
    }

    #[test]
    fn test_path_for_entry() {
        let mut entry = Dictionary::new();
        entry.insert("Path".into(), Value::String("Firmware/dfu/iBSS.img4".into()));
        let mut response = Dictionary::new();
        response.insert("iBSS".into(), Value::Dictionary(entry));

        assert_eq!(path_for_entry(&response, "iBSS"), Some("Firmware/dfu/iBSS.img4"));
        assert_eq!(path_for_entry(&response, "iBEC"), None);
    }
}
