//! Transport seam to the device
//!
//! Device enumeration and the USB (or network) plumbing live outside this
//! crate; a `DeviceProvider` hands out connected sockets and a mode watch.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

/// Any async socket usable for device communication.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ReadWrite for T {}

/// Boxed device socket for dynamic dispatch.
pub type DeviceSocket = Box<dyn ReadWrite>;

/// Coarse device mode as reported by the enumeration callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceMode {
    Restore,
    Recovery,
    Normal,
    Disconnected,
}

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("device transport error")]
    Io(#[from] io::Error),
    #[error("malformed message on restore channel")]
    Plist(#[from] plist::Error),
    #[error("message is not a dictionary")]
    NotADictionary,
    #[error("timed out waiting for restore daemon")]
    Timeout,
    #[error("no device available")]
    NoDevice,
    #[error("remote service is '{0}', not the restore daemon")]
    UnexpectedService(String),
    #[error("device ECID {actual:#x} does not match expected {expected:#x}")]
    EcidMismatch { expected: u64, actual: u64 },
    #[error("device did not report a chip id")]
    NoChipId,
    #[error("device still in restore mode after reboot wait")]
    StillInRestoreMode,
    #[error("restore daemon rejected request: {0}")]
    RequestFailed(String),
}

/// Supplies device connections and mode-change notifications.
///
/// `connect_main` opens the restore daemon's service channel;
/// `connect_port` opens an auxiliary data port the device asked the host to
/// dial (asr, bootability, updater output).
#[allow(async_fn_in_trait)]
pub trait DeviceProvider: Send + Sync {
    fn udid(&self) -> String;

    async fn connect_main(&self) -> Result<DeviceSocket, ProtoError>;

    async fn connect_port(&self, port: u16) -> Result<DeviceSocket, ProtoError>;

    /// Watch channel fed by the enumeration callback on connect/disconnect.
    fn mode_watch(&self) -> watch::Receiver<DeviceMode>;
}
