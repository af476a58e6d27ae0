//! Data-request dispatch
//!
//! The restore daemon asks for everything it needs: boot objects, tickets,
//! the NOR payload, the repacked baseband archive, co-processor firmware,
//! and the bootability stream. This module is the switch on `DataType`
//! plus one builder per reply shape.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anneal_core::archive::EntryStat;
use anneal_core::cpio;
use anneal_core::manifest::{component_name_for_filename, BuildIdentity, RestoreVariant};
use anneal_core::{sign_baseband_archive, RestoreStep};
use anneal_proto::{DeviceProvider, DeviceSocket, ProtoError, RestoreSession};
use anneal_tss::personalize_component;
use anneal_tss::response;
use anyhow::{anyhow, bail, Context, Result};
use plist::{Dictionary, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::driver::{AsrClient, HandlerFailure, RestoreDriver, ASR_PORT};
use crate::updaters::{self, UpdaterContext, UpdaterKind};

/// Chunk size for `FileData` boot-object replies.
const FILE_CHUNK: usize = 8192;

const DATA_PORT_ATTEMPTS: u32 = 10;

/// Built-in empty local policy payload, personalized on demand for the
/// recovery OS.
const LOCAL_POLICY_TEMPLATE: &[u8] = &[
    0x30, 0x1c, 0x16, 0x04, b'I', b'M', b'4', b'P', 0x16, 0x04, b'l', b'p', b'o', b'l', 0x16,
    0x0c, b'l', b'o', b'c', b'a', b'l', b'-', b'p', b'o', b'l', b'i', b'c', b'y', 0x04, 0x00,
];

fn arguments(message: &Dictionary) -> Option<&Dictionary> {
    message.get("Arguments").and_then(Value::as_dictionary)
}

fn argument_bool(message: &Dictionary, key: &str) -> bool {
    arguments(message)
        .and_then(|a| a.get(key))
        .and_then(Value::as_boolean)
        .unwrap_or(false)
}

fn argument_str<'a>(message: &'a Dictionary, key: &str) -> Option<&'a str> {
    arguments(message)
        .and_then(|a| a.get(key))
        .and_then(Value::as_string)
}

/// Map a bootability-bundle entry name to its on-device path; entries
/// outside the bundle are skipped.
pub(crate) fn bootability_subpath(name: &str) -> Option<String> {
    const PREFIX: &str = "BootabilityBundle/Restore/Bootability/";
    const TRUSTCACHE: &str = "BootabilityBundle/Restore/Firmware/Bootability.dmg.trustcache";

    if name == TRUSTCACHE {
        Some("Bootability.trustcache".to_string())
    } else {
        name.strip_prefix(PREFIX).map(str::to_string)
    }
}

/// Dial a device-supplied data port, retrying while the device brings the
/// listener up.
pub(crate) async fn connect_data_port<P: DeviceProvider>(
    provider: &P,
    port: u16,
) -> Result<DeviceSocket, ProtoError> {
    let mut last = ProtoError::NoDevice;
    for attempt in 0..DATA_PORT_ATTEMPTS {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            debug!(port, "Retrying data port connection");
        }
        match provider.connect_port(port).await {
            Ok(socket) => return Ok(socket),
            Err(e) => last = e,
        }
    }
    Err(last)
}

impl<P: DeviceProvider, A: AsrClient> RestoreDriver<P, A> {
    /// The big switch on `DataType`.
    pub(crate) async fn handle_data_request(
        &mut self,
        session: &mut RestoreSession,
        message: &Dictionary,
    ) -> Result<(), HandlerFailure> {
        let Some(data_type) = message.get("DataType").and_then(Value::as_string) else {
            return Ok(());
        };
        let data_type = data_type.to_string();
        let image4 = session.image4_supported();
        debug!(data_type, "Handling data request");

        match data_type.as_str() {
            "SystemImageData" | "RecoveryOSASRImage" => self
                .send_filesystem()
                .await
                .context("unable to send filesystem")
                .map_err(HandlerFailure::filesystem),

            "BuildIdentityDict" => self
                .send_build_identity(session, message)
                .await
                .context("unable to send build identity")
                .map_err(HandlerFailure::fatal),

            "PersonalizedBootObjectV3" => self
                .send_boot_object(session, message, true, image4)
                .await
                .context("unable to send personalized boot object")
                .map_err(HandlerFailure::fatal),

            "SourceBootObjectV4" => self
                .send_boot_object(session, message, false, image4)
                .await
                .context("unable to send source boot object")
                .map_err(HandlerFailure::fatal),

            "RecoveryOSLocalPolicy" => self
                .send_local_policy(session, message, image4)
                .await
                .context("unable to send local policy")
                .map_err(HandlerFailure::fatal),

            "RecoveryOSRootTicketData" => self
                .send_root_ticket(session, true, image4)
                .await
                .context("unable to send recovery OS root ticket")
                .map_err(HandlerFailure::fatal),

            "RootTicket" => self
                .send_root_ticket(session, false, image4)
                .await
                .context("unable to send root ticket")
                .map_err(HandlerFailure::fatal),

            "KernelCache" => self
                .send_component(session, "KernelCache", None, image4)
                .await
                .map_err(HandlerFailure::fatal),

            "DeviceTree" => self
                .send_component(session, "DeviceTree", None, image4)
                .await
                .map_err(HandlerFailure::fatal),

            "SystemImageRootHash" => self
                .send_component(session, "SystemVolume", Some("SystemImageRootHash"), image4)
                .await
                .map_err(HandlerFailure::fatal),

            "SystemImageCanonicalMetadata" => self
                .send_component(
                    session,
                    "Ap,SystemVolumeCanonicalMetadata",
                    Some("SystemImageCanonicalMetadata"),
                    image4,
                )
                .await
                .map_err(HandlerFailure::fatal),

            "NORData" => {
                if self.flags.exclude_nor {
                    info!("Not sending NORData per configuration, quitting");
                    self.quit = true;
                    return Ok(());
                }
                self.send_nor_data(session, message, image4)
                    .await
                    .context("unable to send NOR data")
                    .map_err(HandlerFailure::fatal)
            }

            "BasebandData" => self
                .send_baseband_data(session, message)
                .await
                .context("unable to send baseband data")
                .map_err(HandlerFailure::fatal),

            "FDRTrustData" => self
                .send_fdr_trust_data(session)
                .await
                .map_err(HandlerFailure::fatal),

            "FUDData" => self
                .send_image_data(
                    session,
                    message,
                    "FUDImageList",
                    Some("IsFUDFirmware"),
                    "FUDImageData",
                    image4,
                )
                .await
                .context("unable to send FUD data")
                .map_err(HandlerFailure::fatal),

            "EANData" => self
                .send_image_data(
                    session,
                    message,
                    "EANImageList",
                    Some("IsEarlyAccessFirmware"),
                    "EANData",
                    image4,
                )
                .await
                .context("unable to send EAN data")
                .map_err(HandlerFailure::fatal),

            "PersonalizedData" => self
                .send_image_data(session, message, "ImageList", None, "ImageData", image4)
                .await
                .context("unable to send personalized data")
                .map_err(HandlerFailure::fatal),

            "FirmwareUpdaterData" => self
                .send_firmware_updater_data(session, message, image4)
                .await
                .context("unable to send firmware updater data")
                .map_err(HandlerFailure::fatal),

            "BootabilityBundle" => self
                .send_bootability_bundle(message)
                .await
                .context("unable to send bootability bundle")
                .map_err(HandlerFailure::fatal),

            "BasebandUpdaterOutputData" => {
                self.capture_updater_output(message).await.map_err(HandlerFailure::fatal)
            }

            other => {
                error!(data_type = other, "Unknown data request received");
                Ok(())
            }
        }
    }

    /// The build identity matching this request's variant arguments.
    fn identity_for_request(&self, message: &Dictionary) -> Result<BuildIdentity> {
        let variant = if argument_bool(message, "IsRecoveryOS") {
            RestoreVariant::MacosRecovery
        } else if self.flags.erase {
            RestoreVariant::Erase
        } else {
            RestoreVariant::Upgrade
        };
        self.manifest
            .identity_for(&self.hardware_model, variant)
            .map_err(Into::into)
    }

    /// Component path resolution: ticket-response override first, then the
    /// build identity.
    fn component_path_for(&self, identity: &BuildIdentity, component: &str) -> Result<String> {
        if let Some(tss) = &self.ap_ticket {
            if let Some(path) = response::path_for_entry(tss, component) {
                return Ok(path.to_string());
            }
            debug!(component, "No path override in ticket response, using build identity");
        }
        identity.component_path(component).map_err(Into::into)
    }

    fn personalize(&self, component: &str, data: &[u8], image4: bool) -> Result<Vec<u8>> {
        personalize_component(component, data, self.ap_ticket.as_ref(), image4)
            .with_context(|| format!("unable to personalize component '{component}'"))
    }

    async fn send_filesystem(&self) -> Result<()> {
        let filesystem = self
            .filesystem
            .as_deref()
            .ok_or_else(|| anyhow!("no filesystem image configured"))?;
        info!("About to send filesystem");
        let socket = connect_data_port(&self.provider, ASR_PORT)
            .await
            .context("unable to connect to asr")?;
        let sink = self.progress.clone();
        let progress = move |p: f64| sink.progress(RestoreStep::UploadFilesystem, p);
        self.asr
            .send_filesystem(socket, filesystem, &progress)
            .await?;
        info!("Done sending filesystem");
        Ok(())
    }

    async fn send_build_identity(
        &mut self,
        session: &mut RestoreSession,
        message: &Dictionary,
    ) -> Result<()> {
        info!("About to send BuildIdentityDict");
        let identity = self.identity_for_request(message)?;

        let mut reply = Dictionary::new();
        reply.insert("BuildIdentityDict".into(), identity.to_value());
        let variant = argument_str(message, "Variant").unwrap_or("Erase");
        reply.insert("Variant".into(), Value::String(variant.to_string()));

        session.send(&reply).await?;
        info!("Done sending BuildIdentityDict");
        Ok(())
    }

    async fn send_root_ticket(
        &mut self,
        session: &mut RestoreSession,
        recovery: bool,
        image4: bool,
    ) -> Result<()> {
        let label = if recovery { "RecoveryOSRootTicket" } else { "RootTicket" };
        info!("About to send {label}");

        let mut reply = Dictionary::new();
        if let Some(ticket) = &self.root_ticket_override {
            let key = if recovery {
                "RecoveryOSRootTicketData"
            } else {
                "RootTicketData"
            };
            reply.insert(key.into(), Value::Data(ticket.clone()));
        } else {
            let response = if recovery {
                self.recovery_os_ticket.as_ref()
            } else {
                self.ap_ticket.as_ref()
            };
            if response.is_none() && !self.flags.custom {
                bail!("cannot send {label} without a ticket response");
            }

            let data = if image4 {
                Some(
                    response
                        .and_then(|r| response::ap_img4_ticket(r))
                        .ok_or_else(|| anyhow!("no ApImg4Ticket in ticket response"))?,
                )
            } else if !self.flags.custom {
                // the legacy slot always comes from the AP response
                Some(
                    self.ap_ticket
                        .as_ref()
                        .and_then(|r| response::ap_ticket(r))
                        .ok_or_else(|| anyhow!("no APTicket in ticket response"))?,
                )
            } else {
                None
            };

            match data {
                Some(data) if !data.is_empty() => {
                    reply.insert("RootTicketData".into(), Value::Data(data.to_vec()));
                }
                _ => info!("Not sending RootTicketData (no data present)"),
            }
        }

        session.send(&reply).await?;
        info!("Done sending {label}");
        Ok(())
    }

    async fn send_component(
        &mut self,
        session: &mut RestoreSession,
        component: &str,
        component_name: Option<&str>,
        image4: bool,
    ) -> Result<()> {
        let component_name = component_name.unwrap_or(component);
        info!("About to send {component_name}");

        let path = self.component_path_for(&self.identity, component)?;
        let raw = self
            .archive
            .extract_to_memory(&path)
            .with_context(|| format!("unable to extract component '{component}'"))?;
        let data = self.personalize(component, &raw, image4)?;

        let mut reply = Dictionary::new();
        reply.insert(format!("{component_name}File"), Value::Data(data));
        session.send(&reply).await?;
        info!("Done sending {component_name}");
        Ok(())
    }

    async fn send_boot_object(
        &mut self,
        session: &mut RestoreSession,
        message: &Dictionary,
        personalized: bool,
        image4: bool,
    ) -> Result<()> {
        let image_name = argument_str(message, "ImageName")
            .ok_or_else(|| anyhow!("boot object request without ImageName"))?
            .to_string();
        info!("About to send {image_name}");

        let data = match image_name.as_str() {
            "__GlobalManifest__" => {
                let path = self.identity.global_ticket_path()?;
                self.archive
                    .extract_to_memory(&path)
                    .context("failed to read global manifest")?
            }
            "__RestoreVersion__" => self
                .archive
                .extract_to_memory("RestoreVersion.plist")
                .context("failed to read restore version")?,
            "__SystemVersion__" => self
                .archive
                .extract_to_memory("SystemVersion.plist")
                .context("failed to read system version")?,
            component => {
                let identity = self.identity_for_request(message)?;
                let path = self.component_path_for(&identity, component)?;
                let raw = self
                    .archive
                    .extract_to_memory(&path)
                    .with_context(|| format!("unable to extract component '{component}'"))?;
                if personalized {
                    self.personalize(component, &raw, image4)?
                } else {
                    raw
                }
            }
        };

        info!(bytes = data.len(), "Sending {image_name} now");
        for chunk in data.chunks(FILE_CHUNK) {
            let mut part = Dictionary::new();
            part.insert("FileData".into(), Value::Data(chunk.to_vec()));
            session.send(&part).await?;
        }
        let mut done = Dictionary::new();
        done.insert("FileDataDone".into(), Value::Boolean(true));
        session.send(&done).await?;

        info!("Done sending {image_name}");
        Ok(())
    }

    async fn send_local_policy(
        &mut self,
        session: &mut RestoreSession,
        message: &Dictionary,
        image4: bool,
    ) -> Result<()> {
        info!("About to send RecoveryOSLocalPolicy");
        // The update path has no dedicated recovery-OS identity.
        let variant = if self.flags.erase {
            RestoreVariant::MacosRecovery
        } else {
            RestoreVariant::Upgrade
        };
        let identity = self.manifest.identity_for(&self.hardware_model, variant)?;

        let response = self
            .tickets
            .fetch_local_policy(&identity, arguments(message))?;
        self.local_policy_ticket = Some(response);

        let data = personalize_component(
            "Ap,LocalPolicy",
            LOCAL_POLICY_TEMPLATE,
            self.local_policy_ticket.as_ref(),
            image4,
        )?;

        let mut reply = Dictionary::new();
        reply.insert("Ap,LocalPolicy".into(), Value::Data(data));
        session.send(&reply).await?;
        info!("Done sending RecoveryOSLocalPolicy");
        Ok(())
    }

    /// Assemble the NOR payload dictionary.
    pub(crate) fn build_nor_reply(&self, flash_version_1: bool, image4: bool) -> Result<Dictionary> {
        let llb_path = self.component_path_for(&self.identity, "LLB")?;
        let firmware_dir = Path::new(&llb_path)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!(path = %firmware_dir, "Found firmware path");

        // Prefer the on-archive firmware manifest; fall back to the build
        // identity's flagged payloads.
        let manifest_file = format!("{firmware_dir}/manifest");
        let mut firmware_files: Vec<(String, String)> = Vec::new();
        if self.archive.exists(&manifest_file) {
            info!(path = %manifest_file, "Getting firmware manifest from archive");
            let listing = self.archive.extract_to_memory(&manifest_file)?;
            for line in String::from_utf8_lossy(&listing).split(['\r', '\n']) {
                if line.is_empty() {
                    continue;
                }
                if let Some(component) = component_name_for_filename(line) {
                    firmware_files
                        .push((component.to_string(), format!("{firmware_dir}/{line}")));
                }
            }
        } else {
            info!("Getting firmware manifest from build identity");
            firmware_files = self.identity.firmware_payloads();
        }
        if firmware_files.is_empty() {
            bail!("unable to get list of firmware files");
        }

        let llb_raw = self
            .archive
            .extract_to_memory(&llb_path)
            .context("unable to extract component 'LLB'")?;
        let llb = self.personalize("LLB", &llb_raw, image4)?;

        let mut reply = Dictionary::new();
        reply.insert("LlbImageData".into(), Value::Data(llb));

        let mut nor_dict = Dictionary::new();
        let mut nor_array: Vec<Value> = Vec::new();
        for (component, path) in &firmware_files {
            // LLB goes out as LlbImageData, RestoreSEP as RestoreSEPImageData
            if component == "LLB" || component == "RestoreSEP" {
                continue;
            }
            let raw = self
                .archive
                .extract_to_memory(path)
                .with_context(|| format!("unable to extract component '{component}'"))?;
            let data = self.personalize(component, &raw, image4)?;
            if flash_version_1 {
                nor_dict.insert(component.clone(), Value::Data(data));
            } else if component.starts_with("iBoot") {
                nor_array.insert(0, Value::Data(data));
            } else {
                nor_array.push(Value::Data(data));
            }
        }
        let norimage = if flash_version_1 {
            Value::Dictionary(nor_dict)
        } else {
            Value::Array(nor_array)
        };
        reply.insert("NorImageData".into(), norimage);

        for (component, key) in [("RestoreSEP", "RestoreSEPImageData"), ("SEP", "SEPImageData")] {
            if !self.identity.has_component(component) {
                continue;
            }
            let path = self.identity.component_path(component)?;
            let raw = self
                .archive
                .extract_to_memory(&path)
                .with_context(|| format!("unable to extract component '{component}'"))?;
            let data = self.personalize(component, &raw, image4)?;
            reply.insert(key.to_string(), Value::Data(data));
        }

        Ok(reply)
    }

    async fn send_nor_data(
        &mut self,
        session: &mut RestoreSession,
        message: &Dictionary,
        image4: bool,
    ) -> Result<()> {
        info!("About to send NORData");
        let flash_version_1 = arguments(message)
            .map(|a| a.contains_key("FlashVersion1"))
            .unwrap_or(false);
        let reply = self.build_nor_reply(flash_version_1, image4)?;
        info!("Sending NORData now");
        session.send(&reply).await?;
        info!("Done sending NORData");
        Ok(())
    }

    async fn send_baseband_data(
        &mut self,
        session: &mut RestoreSession,
        message: &Dictionary,
    ) -> Result<()> {
        info!("About to send BasebandData");

        let mut inputs = anneal_tss::client::BasebandInputs {
            ecid: self.ecid,
            ..Default::default()
        };
        if let Some(args) = arguments(message) {
            inputs.chip_id = args
                .get("ChipID")
                .and_then(Value::as_unsigned_integer)
                .unwrap_or(0);
            inputs.gold_cert_id = args
                .get("CertID")
                .and_then(Value::as_unsigned_integer)
                .unwrap_or(0);
            inputs.snum = args
                .get("ChipSerialNo")
                .and_then(Value::as_data)
                .map(<[u8]>::to_vec);
            inputs.nonce = args
                .get("Nonce")
                .and_then(Value::as_data)
                .map(<[u8]>::to_vec);
        }
        let nonce = inputs.nonce.clone();

        // Re-request only when there is no cached response to reuse.
        let mut fetched = None;
        if nonce.is_none() || self.bbtss.is_none() {
            fetched = Some(self.tickets.fetch_baseband(&self.identity, &inputs)?);
        }

        let bbfw_path = self
            .identity
            .component_path("BasebandFirmware")
            .context("unable to get baseband firmware path")?;

        // Working copy of the baseband archive; falls back to the current
        // directory when no temp file can be created.
        let mut fallback_path: Option<PathBuf> = None;
        let temp = match tempfile::Builder::new()
            .prefix("bbfw_")
            .suffix(".tmp")
            .tempfile()
        {
            Ok(file) => Some(file.into_temp_path()),
            Err(e) => {
                let path = PathBuf::from(format!("bbfw_{}.tmp", self.provider.udid()));
                warn!(error = %e, path = %path.display(), "Could not create temporary file, using current directory");
                fallback_path = Some(path);
                None
            }
        };
        let working_path: &Path = temp
            .as_deref()
            .or(fallback_path.as_deref())
            .expect("one of the paths is always set");

        let result = async {
            self.archive
                .extract_to_file(&bbfw_path, working_path)
                .context("unable to extract baseband firmware from archive")?;

            // Cache the ticket response on the first nonce-carrying request.
            if nonce.is_some() && self.bbtss.is_none() {
                self.bbtss = fetched.take();
            }
            let ticket = self
                .bbtss
                .as_ref()
                .or(fetched.as_ref())
                .ok_or_else(|| anyhow!("no baseband ticket response available"))?;

            sign_baseband_archive(working_path, ticket, nonce.as_deref())
                .context("unable to sign baseband firmware")?;

            let data =
                std::fs::read(working_path).context("could not read updated baseband archive")?;
            let mut reply = Dictionary::new();
            reply.insert("BasebandData".into(), Value::Data(data));
            info!("Sending BasebandData now");
            session.send(&reply).await?;
            info!("Done sending BasebandData");
            Ok(())
        }
        .await;

        if let Some(path) = fallback_path {
            let _ = std::fs::remove_file(path);
        }
        result
    }

    async fn send_fdr_trust_data(&mut self, session: &mut RestoreSession) -> Result<()> {
        info!("About to send FDR trust data");
        // An empty dictionary keeps the FDR dance moving; the device asks
        // for nothing more here.
        session.send(&Dictionary::new()).await?;
        info!("Done sending FDR trust data");
        Ok(())
    }

    async fn send_image_data(
        &mut self,
        session: &mut RestoreSession,
        message: &Dictionary,
        list_key: &str,
        type_flag: Option<&str>,
        data_key: &str,
        image4: bool,
    ) -> Result<()> {
        let want_list = argument_bool(message, list_key);
        let image_name = argument_str(message, "ImageName").map(str::to_string);
        let type_key = match type_flag.or_else(|| argument_str(message, "ImageType")) {
            Some(key) => key.to_string(),
            None => bail!("missing ImageType"),
        };

        if !want_list && image_name.is_none() {
            info!("About to send {data_key}");
        }

        let matched = self.identity.components_with_flag(&type_key);

        let mut reply = Dictionary::new();
        if want_list {
            let names: Vec<Value> = matched
                .iter()
                .map(|(name, _)| {
                    info!(component = %name, "Found {type_key} component");
                    Value::String(name.clone())
                })
                .collect();
            reply.insert(list_key.to_string(), Value::Array(names));
            info!("Sending {type_key} image list");
        } else {
            let mut data_dict = Dictionary::new();
            for (name, path) in &matched {
                if let Some(wanted) = &image_name {
                    if wanted != name {
                        continue;
                    }
                } else {
                    info!(component = %name, "Found {type_key} component");
                }
                let raw = match self.archive.extract_to_memory(path) {
                    Ok(raw) => raw,
                    Err(e) => {
                        warn!(component = %name, error = %e, "Unable to extract component");
                        continue;
                    }
                };
                match self.personalize(name, &raw, image4) {
                    Ok(data) => {
                        data_dict.insert(name.clone(), Value::Data(data));
                    }
                    Err(e) => warn!(component = %name, error = %e, "Unable to personalize component"),
                }
            }

            if let Some(name) = image_name {
                if let Some(data) = data_dict.get(&name) {
                    reply.insert(data_key.to_string(), data.clone());
                }
                reply.insert("ImageName".into(), Value::String(name.clone()));
                info!(image = %name, "Sending {type_key}");
            } else {
                reply.insert(data_key.to_string(), Value::Dictionary(data_dict));
                info!("Sending {type_key} now");
            }
        }

        session.send(&reply).await?;
        Ok(())
    }

    async fn send_firmware_updater_data(
        &mut self,
        session: &mut RestoreSession,
        message: &Dictionary,
        image4: bool,
    ) -> Result<()> {
        let args = arguments(message).ok_or_else(|| anyhow!("arguments missing"))?;

        let arg_type = args
            .get("MessageArgType")
            .and_then(Value::as_string)
            .ok_or_else(|| anyhow!("MessageArgType missing or has invalid type"))?;
        if arg_type != "FirmwareResponseData" {
            bail!("MessageArgType has unexpected value '{arg_type}'");
        }
        let updater_name = args
            .get("MessageArgUpdaterName")
            .and_then(Value::as_string)
            .ok_or_else(|| anyhow!("MessageArgUpdaterName missing or has invalid type"))?;
        let info = args
            .get("MessageArgInfo")
            .and_then(Value::as_dictionary)
            .ok_or_else(|| anyhow!("MessageArgInfo missing or has invalid type"))?;
        if let Some(loop_count) = args.get("MessageArgUpdaterLoopCount") {
            debug!(loop_count = ?loop_count, "Updater loop count requested");
        }

        let kind = UpdaterKind::from_updater_name(updater_name, info)
            .ok_or_else(|| anyhow!("got unknown updater name '{updater_name}'"))?;
        info!(updater = updater_name, ?kind, "Preparing firmware updater data");

        let ctx = UpdaterContext {
            archive: &self.archive,
            identity: &self.identity,
            tickets: &self.tickets,
            image4_supported: image4,
        };
        let fwdict = updaters::firmware_data(kind, &ctx, info)?;

        let mut reply = Dictionary::new();
        reply.insert("FirmwareResponseData".into(), Value::Dictionary(fwdict));
        info!("Sending FirmwareResponse data now");
        session.send(&reply).await?;
        info!("Done sending FirmwareUpdater data");
        Ok(())
    }

    async fn send_bootability_bundle(&mut self, message: &Dictionary) -> Result<()> {
        let port = message
            .get("DataPort")
            .and_then(Value::as_unsigned_integer)
            .ok_or_else(|| anyhow!("bootability bundle request without DataPort"))? as u16;

        debug!(port, "Connecting to BootabilityBundle data port");
        let mut socket = connect_data_port(&self.provider, port)
            .await
            .context("unable to connect to bootability data port")?;

        let mut entries: Vec<EntryStat> = Vec::new();
        self.archive.list(|stat| {
            entries.push(stat.clone());
            Ok(())
        })?;

        for stat in entries {
            let Some(subpath) = bootability_subpath(&stat.name) else {
                continue;
            };
            debug!(mode = stat.mode, size = stat.size, path = %subpath, "BootabilityBundle send");

            let data = if (stat.is_regular() || stat.is_symlink()) && stat.size != 0 {
                let data = self.archive.extract_to_memory(&stat.name)?;
                if data.len() as u64 != stat.size {
                    bail!(
                        "expected {} bytes but got {} for file {}",
                        stat.size,
                        data.len(),
                        stat.name
                    );
                }
                Some(data)
            } else {
                None
            };

            let meta = cpio::RecordMeta {
                mode: stat.mode,
                nlink: 1,
                mtime: stat.mtime,
                ..cpio::RecordMeta::default()
            };
            let record = cpio::encode_record(&subpath, &meta, data.as_deref());
            socket.write_all(&record).await?;
        }

        socket.write_all(&cpio::trailer_record()).await?;
        socket.flush().await?;
        info!("Done sending BootabilityBundle");
        Ok(())
    }

    /// Drain the baseband updater's output into a local capture file.
    pub(crate) async fn capture_updater_output(&mut self, message: &Dictionary) -> Result<()> {
        let port = message
            .get("DataPort")
            .and_then(Value::as_unsigned_integer)
            .ok_or_else(|| anyhow!("updater output request without DataPort"))? as u16;

        debug!(port, "Connecting to baseband updater data port");
        let mut socket = connect_data_port(&self.provider, port)
            .await
            .context("unable to connect to baseband updater data port")?;

        let out_path = format!("updater_output-{}.cpio", self.provider.udid());
        let mut out = match tokio::fs::File::create(&out_path).await {
            Ok(file) => Some(file),
            Err(e) => {
                warn!(path = %out_path, error = %e, "Could not open capture file, draining without writing");
                None
            }
        };

        let mut buf = vec![0u8; 65536];
        loop {
            let n = match tokio::io::AsyncReadExt::read(&mut socket, &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            if let Some(file) = &mut out {
                file.write_all(&buf[..n]).await?;
            }
        }
        if out.is_some() {
            info!(path = %out_path, "Wrote baseband updater output data");
        }
        Ok(())
    }
}
