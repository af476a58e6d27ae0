//! Anneal TSS - Ticket authority client and personalization
//!
//! Every firmware payload uploaded during a restore is authorized by the
//! remote ticket authority. This crate builds the per-subsystem signing
//! requests, interprets the responses, and wraps raw components into
//! device-acceptable signed containers.

pub mod client;
pub mod personalize;
pub mod request;
pub mod response;

pub use client::{TicketAuthority, TicketClient, TssError};
pub use personalize::{personalize_component, PersonalizeError};
pub use request::TssRequest;
