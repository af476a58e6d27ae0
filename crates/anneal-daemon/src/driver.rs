//! Restore session driver
//!
//! The driver owns one restore from session open to teardown: it verifies
//! the device, seeds the side channel and restore options, then pumps the
//! message loop, routing each inbound message to its handler until the
//! device reports a final status or a handler fails.
//!
//! Exit codes: 0 on success, -1 for a per-request fatal, -2 when the
//! session could not be opened (or the filesystem send failed), -11 for a
//! transport error while reading, and the negated device `AMRError` when a
//! status message reported one.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anneal_core::archive::FirmwareArchive;
use anneal_core::manifest::{BuildIdentity, BuildManifest, RestoreVariant};
use anneal_core::progress::{adapt_operation, operation_label, step_for_operation, RestoreStep, StatusCode};
use anneal_proto::{DeviceProvider, DeviceSocket, RestoreSession, SideChannel, SideChannelSupervisor};
use anneal_tss::TicketClient;
use anyhow::Result;
use plist::{Dictionary, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::options::{build_restore_options, OptionsInputs};

/// Fixed port of the on-device filesystem streamer.
pub const ASR_PORT: u16 = 12345;

const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Filesystem streamer seam. The driver opens the connection; validation
/// and payload transfer belong to the collaborator.
#[allow(async_fn_in_trait)]
pub trait AsrClient: Send + Sync {
    async fn send_filesystem(
        &self,
        socket: DeviceSocket,
        filesystem: &Path,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<()>;
}

/// Receives stage-keyed progress fractions in `[0, 1]`.
pub trait ProgressSink: Send + Sync {
    fn progress(&self, step: RestoreStep, fraction: f64);
}

/// Default sink: progress goes to the log.
pub struct LogProgressSink;

impl ProgressSink for LogProgressSink {
    fn progress(&self, step: RestoreStep, fraction: f64) {
        info!(?step, percent = (fraction * 100.0).round() as u32, "Progress");
    }
}

/// A failed data-request handler, with the loop exit code it maps to.
#[derive(Debug)]
pub struct HandlerFailure {
    pub code: i64,
    pub error: anyhow::Error,
}

impl HandlerFailure {
    /// Per-request fatal.
    pub fn fatal(error: anyhow::Error) -> Self {
        Self { code: -1, error }
    }

    /// Filesystem upload failed; the session cannot be salvaged.
    pub fn filesystem(error: anyhow::Error) -> Self {
        Self { code: -2, error }
    }
}

/// Caller-selected behavior toggles for one restore.
#[derive(Debug, Clone, Default)]
pub struct RestoreFlags {
    pub erase: bool,
    pub exclude_nor: bool,
    pub ignore_errors: bool,
    /// User supplied their own root ticket; ticket requirements relax on
    /// the root-ticket paths only.
    pub custom: bool,
}

/// Session-scoped inputs assembled by the outer tool.
#[derive(Default)]
pub struct SessionInputs {
    /// AP ticket response from the preflight signing request.
    pub ap_ticket: Option<Dictionary>,
    /// Recovery-OS root ticket response.
    pub recovery_os_ticket: Option<Dictionary>,
    /// Raw user-provided root ticket bytes.
    pub root_ticket_override: Option<Vec<u8>>,
    /// Preflight info captured before entering restore mode.
    pub preflight_info: Option<Dictionary>,
    pub restore_boot_args: Option<String>,
    /// Path to the filesystem image handed to the streamer.
    pub filesystem: Option<PathBuf>,
}

/// Driver lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Opening,
    Seeding,
    Running,
    Finishing,
    Closed,
}

pub struct RestoreDriver<P: DeviceProvider, A: AsrClient> {
    pub(crate) provider: P,
    pub(crate) asr: A,
    pub(crate) archive: FirmwareArchive,
    pub(crate) manifest: BuildManifest,
    pub(crate) identity: BuildIdentity,
    pub(crate) hardware_model: String,
    pub(crate) ecid: u64,
    pub(crate) tickets: TicketClient,
    pub(crate) flags: RestoreFlags,
    pub(crate) progress: Arc<dyn ProgressSink>,
    side_channel: Option<Box<dyn SideChannel>>,
    receive_timeout: Duration,

    pub(crate) ap_ticket: Option<Dictionary>,
    pub(crate) recovery_os_ticket: Option<Dictionary>,
    pub(crate) root_ticket_override: Option<Vec<u8>>,
    pub(crate) preflight_info: Option<Dictionary>,
    pub(crate) restore_boot_args: Option<String>,
    pub(crate) filesystem: Option<PathBuf>,

    // session-scoped mutable state
    pub(crate) bbtss: Option<Dictionary>,
    pub(crate) local_policy_ticket: Option<Dictionary>,
    pub(crate) lastop: u64,
    pub(crate) restore_finished: bool,
    pub(crate) quit: bool,
    state: DriverState,
}

impl<P: DeviceProvider, A: AsrClient> RestoreDriver<P, A> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: P,
        asr: A,
        archive: FirmwareArchive,
        manifest: BuildManifest,
        hardware_model: &str,
        ecid: u64,
        inputs: SessionInputs,
        flags: RestoreFlags,
        tickets: TicketClient,
    ) -> Result<Self> {
        let variant = if flags.erase {
            RestoreVariant::Erase
        } else {
            RestoreVariant::Upgrade
        };
        let identity = manifest.identity_for(hardware_model, variant)?;

        Ok(Self {
            provider,
            asr,
            archive,
            manifest,
            identity,
            hardware_model: hardware_model.to_string(),
            ecid,
            tickets,
            flags,
            progress: Arc::new(LogProgressSink),
            side_channel: None,
            receive_timeout: DEFAULT_RECEIVE_TIMEOUT,
            ap_ticket: inputs.ap_ticket,
            recovery_os_ticket: inputs.recovery_os_ticket,
            root_ticket_override: inputs.root_ticket_override,
            preflight_info: inputs.preflight_info,
            restore_boot_args: inputs.restore_boot_args,
            filesystem: inputs.filesystem,
            bbtss: None,
            local_policy_ticket: None,
            lastop: 0,
            restore_finished: false,
            quit: false,
            state: DriverState::Opening,
        })
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = sink;
        self
    }

    pub fn with_side_channel(mut self, channel: Box<dyn SideChannel>) -> Self {
        self.side_channel = Some(channel);
        self
    }

    pub fn with_receive_timeout(mut self, timeout: Duration) -> Self {
        self.receive_timeout = timeout;
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Drive one restore to completion. Returns the session exit code.
    pub async fn run(&mut self) -> i64 {
        self.state = DriverState::Opening;
        let mut session = match RestoreSession::open_with_timeout(
            &self.provider,
            self.ecid,
            "anneal",
            self.receive_timeout,
        )
        .await
        {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Unable to open device in restore mode");
                return -2;
            }
        };
        info!(udid = %session.udid(), "Device has successfully entered restore mode");

        self.log_hardware_info(&session);
        self.log_saved_debug_info(&mut session).await;

        // Reuse a baseband ticket delivered with the AP response.
        if let Some(tss) = &self.ap_ticket {
            if tss.contains_key("BBTicket") {
                self.bbtss = Some(tss.clone());
            }
        }

        self.state = DriverState::Seeding;
        let supervisor = self.side_channel.take().map(|channel| {
            info!("Starting side channel");
            SideChannelSupervisor::start(channel)
        });

        let session_uuid = Uuid::new_v4().to_string().to_uppercase();
        let options = build_restore_options(&OptionsInputs {
            identity: &self.identity,
            preflight_info: self.preflight_info.as_ref(),
            restore_boot_args: self.restore_boot_args.as_deref(),
            erase: self.flags.erase,
            session_uuid: &session_uuid,
        });
        if let Err(e) = session.start_restore(&options).await {
            error!(error = %e, "Unable to start the restore process");
            if let Some(supervisor) = supervisor {
                supervisor.shutdown();
            }
            session.close().await;
            return -1;
        }
        self.progress.progress(RestoreStep::Prepare, 1.0);

        self.state = DriverState::Running;
        let mut err: i64 = 0;
        while !self.quit {
            let message = match session.receive(self.receive_timeout).await {
                Ok(None) => {
                    debug!("No data to read (timeout)");
                    continue;
                }
                Ok(Some(message)) => message,
                Err(e) => {
                    error!(error = %e, "Could not read data, aborting");
                    err = -11;
                    break;
                }
            };

            err = self.route_message(&mut session, &message).await;
            if err < 0 {
                if self.flags.ignore_errors {
                    warn!("Attempting to continue after critical error, restore might fail");
                    err = 0;
                } else {
                    error!("Unable to successfully restore device");
                    self.quit = true;
                }
            }
        }

        self.state = DriverState::Finishing;
        if let Some(supervisor) = supervisor {
            supervisor.shutdown();
        }
        session.close().await;
        self.state = DriverState::Closed;
        err
    }

    async fn route_message(
        &mut self,
        session: &mut RestoreSession,
        message: &Dictionary,
    ) -> i64 {
        let Some(msg_type) = message.get("MsgType").and_then(Value::as_string) else {
            debug!("Message without MsgType received, skipping");
            return 0;
        };
        let msg_type = msg_type.to_string();
        let protocol_version = session.protocol_version();

        match msg_type.as_str() {
            "DataRequestMsg" => match self.handle_data_request(session, message).await {
                Ok(()) => 0,
                Err(failure) => {
                    error!(error = %failure.error, "Data request failed");
                    failure.code
                }
            },
            "PreviousRestoreLogMsg" => self.handle_previous_restore_log(message),
            "ProgressMsg" => self.handle_progress(message, protocol_version),
            "StatusMsg" => {
                let code = self.handle_status(message);
                if self.restore_finished {
                    let mut ack = Dictionary::new();
                    ack.insert(
                        "MsgType".into(),
                        Value::String("ReceivedFinalStatusMsg".into()),
                    );
                    if let Err(e) = session.send(&ack).await {
                        warn!(error = %e, "Failed to acknowledge final status");
                    }
                    self.quit = true;
                }
                code
            }
            "CheckpointMsg" => self.handle_checkpoint(message),
            "BBUpdateStatusMsg" => self.handle_bb_update_status(message),
            "BasebandUpdaterOutputData" => match self.capture_updater_output(message).await {
                Ok(()) => 0,
                Err(e) => {
                    error!(error = %e, "Unable to capture baseband updater output");
                    -1
                }
            },
            other => {
                debug!(msg_type = other, "Unknown message type received");
                0
            }
        }
    }

    fn log_hardware_info(&self, session: &RestoreSession) {
        let hwinfo = session.hardware_info();
        info!("Hardware information:");
        if let Some(board_id) = hwinfo.get("BoardID").and_then(Value::as_unsigned_integer) {
            info!(board_id, "BoardID");
        }
        if let Some(chip_id) = hwinfo.get("ChipID").and_then(Value::as_unsigned_integer) {
            info!(chip_id, "ChipID");
        }
        if let Some(ecid) = hwinfo.get("UniqueChipID").and_then(Value::as_unsigned_integer) {
            info!(ecid, "UniqueChipID");
        }
        if let Some(production) = hwinfo.get("ProductionMode").and_then(Value::as_boolean) {
            info!(production, "ProductionMode");
        }
    }

    async fn log_saved_debug_info(&self, session: &mut RestoreSession) {
        let saved = match session.query_value("SavedDebugInfo", self.receive_timeout).await {
            Ok(Some(value)) => value,
            _ => return,
        };
        let Some(saved) = saved.as_dictionary() else {
            return;
        };
        if let Some(status) = saved.get("PreviousExitStatus").and_then(Value::as_string) {
            info!(status, "Previous restore exit status");
        }
        if let Some(log) = saved.get("USBLog").and_then(Value::as_string) {
            info!("USB log is available:\n{log}");
        }
        if let Some(log) = saved.get("PanicLog").and_then(Value::as_string) {
            info!("Panic log is available:\n{log}");
        }
    }

    fn handle_previous_restore_log(&self, message: &Dictionary) -> i64 {
        let Some(log) = message
            .get("PreviousRestoreLog")
            .and_then(Value::as_string)
        else {
            debug!("Failed to parse PreviousRestoreLog, skipping");
            return 0;
        };
        info!("Previous restore log received:\n{log}");
        0
    }

    fn handle_progress(&mut self, message: &Dictionary, protocol_version: u64) -> i64 {
        let Some(operation) = message
            .get("Operation")
            .and_then(Value::as_unsigned_integer)
        else {
            debug!("Failed to parse operation from ProgressMsg, skipping");
            return 0;
        };
        let Some(progress) = message.get("Progress").and_then(Value::as_unsigned_integer) else {
            debug!("Failed to parse progress from ProgressMsg, skipping");
            return 0;
        };

        let adapted = adapt_operation(operation, protocol_version);
        if progress > 0 && progress <= 100 {
            if operation != self.lastop {
                info!("{} ({})", operation_label(adapted), operation);
            }
            match step_for_operation(adapted) {
                Some(step) => self.progress.progress(step, progress as f64 / 100.0),
                None => debug!(operation = adapted, "Unhandled progress operation"),
            }
        } else {
            info!("{} ({})", operation_label(adapted), operation);
        }
        self.lastop = operation;
        0
    }

    fn handle_status(&mut self, message: &Dictionary) -> i64 {
        info!("Got status message");
        let Some(status) = message.get("Status").and_then(Value::as_unsigned_integer) else {
            debug!("Status message without Status field, skipping");
            return 0;
        };

        let code = StatusCode::from_raw(status);
        match code {
            StatusCode::Other(value) => info!(status = value, "Unhandled status message"),
            _ => info!("Status: {}", code.label()),
        }
        if code.is_terminal_success() {
            self.restore_finished = true;
        }

        let mut result = 0i64;
        if let Some(amr) = message.get("AMRError").and_then(Value::as_unsigned_integer) {
            let amr = amr as i64;
            result = if amr > 0 { -amr } else { amr };
        }

        if let Some(log) = message.get("Log").and_then(Value::as_string) {
            info!("Log is available:\n{log}");
        }
        result
    }

    fn handle_checkpoint(&self, message: &Dictionary) -> i64 {
        let Some(id) = message
            .get("CHECKPOINT_ID")
            .and_then(Value::as_unsigned_integer)
        else {
            debug!("Failed to parse checkpoint id, skipping");
            return 0;
        };
        let Some(result) = message
            .get("CHECKPOINT_RESULT")
            .and_then(Value::as_unsigned_integer)
        else {
            debug!("Failed to parse checkpoint result, skipping");
            return 0;
        };
        let complete = message
            .get("CHECKPOINT_COMPLETE")
            .and_then(Value::as_boolean)
            .unwrap_or(false);
        if complete {
            info!(checkpoint = id, code = result, "Checkpoint complete");
        } else {
            debug!(checkpoint = id, code = result, "Checkpoint update");
        }
        0
    }

    fn handle_bb_update_status(&self, message: &Dictionary) -> i64 {
        let accepted = message
            .get("Accepted")
            .and_then(Value::as_boolean)
            .unwrap_or(false);
        if !accepted {
            error!("Device did not accept BasebandData");
            return -1;
        }

        let output = message.get("Output").and_then(Value::as_dictionary);
        let done = output
            .and_then(|o| o.get("done"))
            .and_then(Value::as_boolean)
            .unwrap_or(false);
        if done {
            info!("Updating baseband completed");
            if let Some(imei) = output
                .and_then(|o| o.get("provisioning"))
                .and_then(Value::as_dictionary)
                .and_then(|p| p.get("IMEI"))
                .and_then(Value::as_string)
            {
                info!(imei, "Provisioning");
            }
        } else {
            info!("Updating baseband in progress...");
        }
        0
    }
}
