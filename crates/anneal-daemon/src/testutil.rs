//! Shared test fixtures: a scriptable device provider, canned ticket
//! authority, and small firmware archives.

use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anneal_core::archive::FirmwareArchive;
use anneal_core::manifest::BuildManifest;
use anneal_core::progress::RestoreStep;
use anneal_proto::{
    DeviceMode, DeviceProvider, DeviceSocket, MessageCodec, ProtoError, RestoreSession,
};
use anneal_tss::client::{TicketAuthority, TssError};
use anneal_tss::TicketClient;
use plist::{Dictionary, Value};
use tokio::sync::watch;

use crate::driver::{AsrClient, ProgressSink};

pub(crate) const TEST_ECID: u64 = 0x1122334455;

pub(crate) struct MockProvider {
    sockets: Mutex<VecDeque<DeviceSocket>>,
    pub mode_tx: watch::Sender<DeviceMode>,
}

impl MockProvider {
    pub fn new(sockets: Vec<DeviceSocket>) -> Self {
        let (mode_tx, _) = watch::channel(DeviceMode::Restore);
        Self {
            sockets: Mutex::new(sockets.into()),
            mode_tx,
        }
    }
}

impl DeviceProvider for MockProvider {
    fn udid(&self) -> String {
        "00008101-000A1B2C3D4E5F".to_string()
    }

    async fn connect_main(&self) -> Result<DeviceSocket, ProtoError> {
        self.sockets
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(ProtoError::NoDevice)
    }

    async fn connect_port(&self, _port: u16) -> Result<DeviceSocket, ProtoError> {
        self.connect_main().await
    }

    fn mode_watch(&self) -> watch::Receiver<DeviceMode> {
        self.mode_tx.subscribe()
    }
}

pub(crate) struct NullAsr;

impl AsrClient for NullAsr {
    async fn send_filesystem(
        &self,
        _socket: DeviceSocket,
        _filesystem: &Path,
        _progress: &(dyn Fn(f64) + Send + Sync),
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Ticket authority returning one canned response, counting calls.
pub(crate) struct StaticAuthority {
    pub response: Dictionary,
    pub calls: AtomicUsize,
}

impl StaticAuthority {
    pub fn returning(response: Dictionary) -> Arc<Self> {
        Arc::new(Self {
            response,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn client(self: Arc<Self>) -> TicketClient {
        TicketClient::new(self)
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl TicketAuthority for StaticAuthority {
    fn send_request(&self, _request: &Dictionary) -> Result<Dictionary, TssError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.response.clone())
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    pub steps: Mutex<Vec<(RestoreStep, f64)>>,
}

impl ProgressSink for RecordingSink {
    fn progress(&self, step: RestoreStep, fraction: f64) {
        self.steps.lock().unwrap().push((step, fraction));
    }
}

/// AP ticket response for an image4-capable device.
pub(crate) fn ap_response_img4() -> Dictionary {
    let mut dict = Dictionary::new();
    dict.insert("ApImg4Ticket".into(), Value::Data(vec![0xa5; 32]));
    dict
}

/// AP ticket response for a legacy device.
pub(crate) fn ap_response_legacy() -> Dictionary {
    let mut dict = Dictionary::new();
    dict.insert("APTicket".into(), Value::Data(vec![0x01; 16]));
    dict
}

fn component(path: &str, flags: &[&str]) -> Value {
    let mut info = Dictionary::new();
    info.insert("Path".into(), Value::String(path.into()));
    for flag in flags {
        info.insert((*flag).into(), Value::Boolean(true));
    }
    let mut entry = Dictionary::new();
    entry.insert("Info".into(), Value::Dictionary(info));
    Value::Dictionary(entry)
}

fn identity_dict(variant: &str) -> Dictionary {
    let mut info = Dictionary::new();
    info.insert("DeviceClass".into(), Value::String("n71ap".into()));
    info.insert("Variant".into(), Value::String(variant.into()));

    let mut manifest = Dictionary::new();
    manifest.insert(
        "LLB".into(),
        component("Firmware/all_flash/LLB.im4p", &["IsFirmwarePayload"]),
    );
    manifest.insert(
        "iBoot".into(),
        component("Firmware/all_flash/iBoot.im4p", &["IsFirmwarePayload"]),
    );
    manifest.insert(
        "iBootData".into(),
        component("Firmware/all_flash/iBootData.im4p", &["IsFirmwarePayload"]),
    );
    manifest.insert(
        "KernelCache".into(),
        component("kernelcache.release.n71", &[]),
    );
    manifest.insert(
        "Ap,FastAfterburner".into(),
        component("Firmware/fab.im4p", &["IsFUDFirmware"]),
    );
    manifest.insert(
        "BasebandFirmware".into(),
        component("Firmware/Baseband.bbfw", &[]),
    );

    let mut dict = Dictionary::new();
    dict.insert("Info".into(), Value::Dictionary(info));
    dict.insert("Manifest".into(), Value::Dictionary(manifest));
    dict
}

pub(crate) fn test_manifest() -> BuildManifest {
    let mut root = Dictionary::new();
    root.insert(
        "BuildIdentities".into(),
        Value::Array(vec![
            Value::Dictionary(identity_dict("Customer Erase Install (IPSW)")),
            Value::Dictionary(identity_dict("Customer Upgrade Install (IPSW)")),
        ]),
    );
    let mut buf = Vec::new();
    Value::Dictionary(root).to_writer_xml(&mut buf).unwrap();
    BuildManifest::from_bytes(&buf).unwrap()
}

/// Build a zip firmware archive from (name, contents) pairs.
pub(crate) fn test_archive(entries: &[(&str, &[u8])]) -> (tempfile::NamedTempFile, FirmwareArchive) {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let mut writer = zip::ZipWriter::new(tmp.reopen().unwrap());
    for (name, data) in entries {
        writer
            .start_file(*name, zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();
    let archive = FirmwareArchive::open(tmp.path()).unwrap();
    (tmp, archive)
}

/// Entries matching `test_manifest` component paths.
pub(crate) fn default_archive_entries() -> Vec<(&'static str, &'static [u8])> {
    vec![
        ("Firmware/all_flash/LLB.im4p", &b"llb-payload"[..]),
        ("Firmware/all_flash/iBoot.im4p", &b"iboot-payload"[..]),
        ("Firmware/all_flash/iBootData.im4p", &b"ibootdata-payload"[..]),
        ("kernelcache.release.n71", &b"kernelcache-payload"[..]),
        ("Firmware/fab.im4p", &b"fab-payload"[..]),
    ]
}

/// Answer the session-open handshake from the device side: QueryType then
/// the HardwareInfo query.
pub(crate) async fn device_open_replies(
    codec: &mut MessageCodec,
    protocol_version: u64,
    ecid: u64,
    image4: bool,
) {
    let timeout = Duration::from_secs(5);
    let _ = codec.receive(timeout).await.unwrap().unwrap();
    let mut reply = Dictionary::new();
    reply.insert(
        "Type".into(),
        Value::String("com.apple.mobile.restored".into()),
    );
    reply.insert(
        "RestoreProtocolVersion".into(),
        Value::Integer(protocol_version.into()),
    );
    codec.send(&reply).await.unwrap();

    let _ = codec.receive(timeout).await.unwrap().unwrap();
    let mut hwinfo = Dictionary::new();
    hwinfo.insert("UniqueChipID".into(), Value::Integer(ecid.into()));
    hwinfo.insert("SupportsImage4".into(), Value::Boolean(image4));
    hwinfo.insert("BoardID".into(), Value::Integer(8.into()));
    hwinfo.insert("ChipID".into(), Value::Integer(0x8010.into()));
    let mut reply = Dictionary::new();
    reply.insert("HardwareInfo".into(), Value::Dictionary(hwinfo));
    codec.send(&reply).await.unwrap();
}

/// The full driver-startup dialogue: handshake, SavedDebugInfo, then the
/// StartRestore request, which is returned.
pub(crate) async fn device_startup_replies(
    codec: &mut MessageCodec,
    protocol_version: u64,
    ecid: u64,
    image4: bool,
) -> Dictionary {
    let timeout = Duration::from_secs(5);
    device_open_replies(codec, protocol_version, ecid, image4).await;

    // SavedDebugInfo query
    let _ = codec.receive(timeout).await.unwrap().unwrap();
    let mut reply = Dictionary::new();
    reply.insert("SavedDebugInfo".into(), Value::Dictionary(Dictionary::new()));
    codec.send(&reply).await.unwrap();

    // StartRestore
    codec.receive(timeout).await.unwrap().unwrap()
}

/// Open a real session over a duplex pair; returns the host session and
/// the device-side codec.
pub(crate) async fn open_test_session(image4: bool) -> (RestoreSession, MessageCodec) {
    let (host, device) = tokio::io::duplex(1 << 20);
    let provider = MockProvider::new(vec![Box::new(host)]);
    let mut device_codec = MessageCodec::new(Box::new(device));

    let (session, ()) = tokio::join!(
        async {
            RestoreSession::open_with_timeout(&provider, TEST_ECID, "anneal", Duration::from_secs(5))
                .await
                .unwrap()
        },
        device_open_replies(&mut device_codec, 15, TEST_ECID, image4),
    );
    (session, device_codec)
}
