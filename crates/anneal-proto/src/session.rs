//! Restore session lifecycle
//!
//! Opening a session connects to the on-device restore daemon, verifies it
//! is the expected service, and matches the device identity (ECID) against
//! the configured one. The negotiated protocol version is cached for the
//! rest of the session; it drives operation-code adaptation and is echoed
//! back when the restore is started.

use std::time::Duration;

use plist::{Dictionary, Value};
use tracing::{debug, info, warn};

use crate::codec::MessageCodec;
use crate::transport::{DeviceMode, DeviceProvider, ProtoError};

/// Service identity the restore daemon reports.
pub const RESTORE_SERVICE_TYPE: &str = "com.apple.mobile.restored";

const REBOOT_WAIT: Duration = Duration::from_secs(30);

/// An open dialogue with the on-device restore daemon.
pub struct RestoreSession {
    codec: MessageCodec,
    udid: String,
    label: String,
    protocol_version: u64,
    hardware_info: Dictionary,
}

impl std::fmt::Debug for RestoreSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RestoreSession")
            .field("udid", &self.udid)
            .field("label", &self.label)
            .field("protocol_version", &self.protocol_version)
            .field("hardware_info", &self.hardware_info)
            .finish()
    }
}

impl RestoreSession {
    /// Connect, verify the service identity, and match the device ECID.
    ///
    /// An `expected_ecid` of zero skips the identity check.
    pub async fn open_with_timeout<P: DeviceProvider>(
        provider: &P,
        expected_ecid: u64,
        label: &str,
        timeout: Duration,
    ) -> Result<Self, ProtoError> {
        let socket = provider.connect_main().await?;
        let mut session = Self {
            codec: MessageCodec::new(socket),
            udid: provider.udid(),
            label: label.to_string(),
            protocol_version: 0,
            hardware_info: Dictionary::new(),
        };

        let mut query = Dictionary::new();
        query.insert("Request".into(), Value::String("QueryType".into()));
        query.insert("Label".into(), Value::String(session.label.clone()));
        let response = session.request(&query, timeout).await?;

        let service_type = response
            .get("Type")
            .and_then(Value::as_string)
            .unwrap_or_default();
        if service_type != RESTORE_SERVICE_TYPE {
            return Err(ProtoError::UnexpectedService(service_type.to_string()));
        }
        session.protocol_version = response
            .get("RestoreProtocolVersion")
            .and_then(Value::as_unsigned_integer)
            .unwrap_or(0);
        info!(
            service = RESTORE_SERVICE_TYPE,
            version = session.protocol_version,
            "Connected to restore daemon"
        );

        let hwinfo = session
            .query_value("HardwareInfo", timeout)
            .await?
            .and_then(Value::into_dictionary)
            .unwrap_or_default();

        if expected_ecid != 0 {
            let actual = hwinfo
                .get("UniqueChipID")
                .and_then(Value::as_unsigned_integer)
                .ok_or(ProtoError::NoChipId)?;
            if actual != expected_ecid {
                return Err(ProtoError::EcidMismatch {
                    expected: expected_ecid,
                    actual,
                });
            }
        }
        session.hardware_info = hwinfo;

        Ok(session)
    }

    pub fn udid(&self) -> &str {
        &self.udid
    }

    pub fn protocol_version(&self) -> u64 {
        self.protocol_version
    }

    pub fn hardware_info(&self) -> &Dictionary {
        &self.hardware_info
    }

    /// Whether the device accepts image4-personalized payloads.
    pub fn image4_supported(&self) -> bool {
        self.hardware_info
            .get("SupportsImage4")
            .and_then(Value::as_boolean)
            .unwrap_or(false)
    }

    async fn request(
        &mut self,
        message: &Dictionary,
        timeout: Duration,
    ) -> Result<Dictionary, ProtoError> {
        self.codec.send(message).await?;
        self.codec
            .receive(timeout)
            .await?
            .ok_or(ProtoError::Timeout)
    }

    /// Query one named value from the daemon.
    pub async fn query_value(
        &mut self,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<Value>, ProtoError> {
        let mut query = Dictionary::new();
        query.insert("Request".into(), Value::String("QueryValue".into()));
        query.insert("Label".into(), Value::String(self.label.clone()));
        query.insert("QueryKey".into(), Value::String(key.to_string()));
        let mut response = self.request(&query, timeout).await?;
        Ok(response.remove(key))
    }

    /// Kick off the restore with the assembled options dictionary.
    pub async fn start_restore(&mut self, options: &Dictionary) -> Result<(), ProtoError> {
        let mut message = Dictionary::new();
        message.insert("Request".into(), Value::String("StartRestore".into()));
        message.insert("Label".into(), Value::String(self.label.clone()));
        message.insert("RestoreOptions".into(), Value::Dictionary(options.clone()));
        message.insert(
            "RestoreProtocolVersion".into(),
            Value::Integer(self.protocol_version.into()),
        );
        self.codec.send(&message).await
    }

    pub async fn send(&mut self, message: &Dictionary) -> Result<(), ProtoError> {
        self.codec.send(message).await
    }

    pub async fn receive(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Dictionary>, ProtoError> {
        self.codec.receive(timeout).await
    }

    /// Reboot the device and wait (bounded) for it to leave restore mode.
    pub async fn reboot<P: DeviceProvider>(mut self, provider: &P) -> Result<(), ProtoError> {
        info!("Rebooting restore mode device");
        let mut message = Dictionary::new();
        message.insert("Request".into(), Value::String("Reboot".into()));
        message.insert("Label".into(), Value::String(self.label.clone()));
        self.codec.send(&message).await?;

        let mut watch = provider.mode_watch();
        let wait = async {
            while *watch.borrow() == DeviceMode::Restore {
                if watch.changed().await.is_err() {
                    break;
                }
            }
        };
        let _ = tokio::time::timeout(REBOOT_WAIT, wait).await;

        if *watch.borrow() == DeviceMode::Restore {
            return Err(ProtoError::StillInRestoreMode);
        }
        Ok(())
    }

    /// Close the session, telling the daemon goodbye on a best-effort basis.
    pub async fn close(mut self) {
        let mut message = Dictionary::new();
        message.insert("Request".into(), Value::String("Goodbye".into()));
        message.insert("Label".into(), Value::String(self.label.clone()));
        if let Err(e) = self.codec.send(&message).await {
            warn!(error = %e, "Failed to send goodbye");
        } else {
            debug!("Session closed");
        }
    }
}
