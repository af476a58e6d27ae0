//! Anneal Daemon - Restore session driver
//!
//! Orchestrates one restore against a device in restore mode: session
//! open, option seeding, the message loop, and the data-request
//! dispatcher. Device transports, the ticket authority HTTP client, and
//! the filesystem streamer are injected through collaborator traits.

pub mod config;
pub mod driver;
pub mod handlers;
pub mod options;
pub mod updaters;

#[cfg(test)]
pub(crate) mod testutil;

pub use driver::{
    AsrClient, DriverState, HandlerFailure, LogProgressSink, ProgressSink, RestoreDriver,
    RestoreFlags, SessionInputs,
};
