//! Anneal Proto - Restore-mode device dialogue
//!
//! The restore daemon on the device drives a typed-dictionary dialogue over
//! a length-prefixed plist channel. This crate owns the transport seam, the
//! message codec, the session lifecycle (open, identify, reboot, close),
//! and the side-channel supervisor that keeps the device's tunnel back to
//! host services alive for the duration of a restore.

pub mod codec;
pub mod session;
pub mod sidechannel;
pub mod transport;

pub use codec::MessageCodec;
pub use session::{RestoreSession, RESTORE_SERVICE_TYPE};
pub use sidechannel::{ProxyEvent, SideChannel, SideChannelSupervisor};
pub use transport::{DeviceMode, DeviceProvider, DeviceSocket, ProtoError, ReadWrite};
