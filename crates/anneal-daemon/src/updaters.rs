//! Firmware updater dispatch
//!
//! `FirmwareUpdaterData` requests name one of several co-processor
//! updaters. Each variant fetches its subsystem ticket, pulls the matching
//! component out of the archive, massages it into the shape that updater
//! expects, and embeds it as `FirmwareData` in the ticket response.

use anneal_core::archive::FirmwareArchive;
use anneal_core::ftab::{fourcc, Ftab, RECOVERY_OS_ENTRY, RTKIT_OS_TAG};
use anneal_core::manifest::BuildIdentity;
use anneal_tss::TicketClient;
use anyhow::{anyhow, bail, Context, Result};
use byteorder::{ByteOrder, LittleEndian};
use plist::{Dictionary, Value};
use std::io::Cursor;
use tracing::{debug, info, warn};

/// The updater kinds the restore daemon can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdaterKind {
    Se,
    Savage,
    Yonkers,
    Rose,
    Veridian,
    AppleTcon,
    Timer,
}

impl UpdaterKind {
    /// Resolve the updater from `MessageArgUpdaterName`. A `Savage` request
    /// whose info carries `YonkersDeviceInfo` is really a Yonkers update.
    pub fn from_updater_name(name: &str, info: &Dictionary) -> Option<Self> {
        match name {
            "SE" => Some(UpdaterKind::Se),
            "Savage" => {
                if info
                    .get("YonkersDeviceInfo")
                    .and_then(Value::as_dictionary)
                    .is_some()
                {
                    Some(UpdaterKind::Yonkers)
                } else {
                    Some(UpdaterKind::Savage)
                }
            }
            "Rose" => Some(UpdaterKind::Rose),
            "T200" => Some(UpdaterKind::Veridian),
            "AppleTCON" => Some(UpdaterKind::AppleTcon),
            "AppleTypeCRetimer" => Some(UpdaterKind::Timer),
            _ => None,
        }
    }
}

/// Everything an updater needs to build its reply.
pub struct UpdaterContext<'a> {
    pub archive: &'a FirmwareArchive,
    pub identity: &'a BuildIdentity,
    pub tickets: &'a TicketClient,
    pub image4_supported: bool,
}

/// Build the `FirmwareData`-bearing ticket response for one updater.
pub fn firmware_data(
    kind: UpdaterKind,
    ctx: &UpdaterContext<'_>,
    info: &Dictionary,
) -> Result<Dictionary> {
    match kind {
        UpdaterKind::Se => se_firmware_data(ctx, info),
        UpdaterKind::Savage => savage_firmware_data(ctx, info),
        UpdaterKind::Yonkers => yonkers_firmware_data(ctx, info),
        UpdaterKind::Rose => rose_firmware_data(ctx, info),
        UpdaterKind::Veridian => veridian_firmware_data(ctx, info),
        UpdaterKind::AppleTcon => tcon_firmware_data(ctx, info),
        UpdaterKind::Timer => timer_firmware_data(ctx, info),
    }
}

fn extract_component(ctx: &UpdaterContext<'_>, component: &str) -> Result<Vec<u8>> {
    let path = ctx
        .identity
        .component_path(component)
        .with_context(|| format!("no path for '{component}' component"))?;
    ctx.archive
        .extract_to_memory(&path)
        .with_context(|| format!("unable to extract '{component}' component"))
}

/// Which SE component a given chip wants.
pub fn se_component_name(identity: &BuildIdentity, info: &Dictionary) -> Result<&'static str> {
    let chip_id = info
        .get("SE,ChipID")
        .and_then(Value::as_unsigned_integer)
        .unwrap_or(0);
    match chip_id {
        0x20211 => Ok("SE,Firmware"),
        0x73 | 0x64 | 0xc8 | 0xd2 => Ok("SE,UpdatePayload"),
        other => {
            warn!("Unknown SE,ChipID {other:#x} detected, restore might fail");
            if identity.has_component("SE,UpdatePayload") {
                Ok("SE,UpdatePayload")
            } else if identity.has_component("SE,Firmware") {
                Ok("SE,Firmware")
            } else {
                bail!("neither 'SE,Firmware' nor 'SE,UpdatePayload' found in build identity")
            }
        }
    }
}

fn se_firmware_data(ctx: &UpdaterContext<'_>, info: &Dictionary) -> Result<Dictionary> {
    let comp_name = se_component_name(ctx.identity, info)?;
    debug!(component = comp_name, "Using SE component");
    let component = extract_component(ctx, comp_name)?;
    let mut response = ctx.tickets.fetch_se(ctx.identity, info)?;
    response.insert("FirmwareData".into(), Value::Data(component));
    Ok(response)
}

/// Savage payloads are uploaded behind a 16-byte header that carries the
/// payload length at offset 4.
pub fn savage_prefix(component: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; 16 + component.len()];
    LittleEndian::write_u32(&mut out[4..8], component.len() as u32);
    out[16..].copy_from_slice(component);
    out
}

fn savage_firmware_data(ctx: &UpdaterContext<'_>, info: &Dictionary) -> Result<Dictionary> {
    let (mut response, comp_name) = ctx.tickets.fetch_savage(ctx.identity, info)?;
    let component = extract_component(ctx, &comp_name)?;
    response.insert("FirmwareData".into(), Value::Data(savage_prefix(&component)));
    Ok(response)
}

fn yonkers_firmware_data(ctx: &UpdaterContext<'_>, info: &Dictionary) -> Result<Dictionary> {
    let info = info
        .get("YonkersDeviceInfo")
        .and_then(Value::as_dictionary)
        .unwrap_or(info);
    let (mut response, comp_name) = ctx.tickets.fetch_yonkers(ctx.identity, info)?;
    let component = extract_component(ctx, &comp_name)?;

    let mut firmware_data = Dictionary::new();
    firmware_data.insert("YonkersFirmware".into(), Value::Data(component));
    response.insert("FirmwareData".into(), Value::Dictionary(firmware_data));
    Ok(response)
}

/// Compose the boot-RTKit ftab: the base table, plus the recovery table's
/// `rrko` entry when a companion recovery component exists.
pub fn compose_rtkit_ftab(
    ctx: &UpdaterContext<'_>,
    base_component: &str,
    recovery_component: &str,
) -> Result<Vec<u8>> {
    let base_data = extract_component(ctx, base_component)?;
    let mut base = Ftab::parse(&base_data)
        .with_context(|| format!("failed to parse '{base_component}' component data"))?;
    if base.container_tag() != RTKIT_OS_TAG {
        warn!(
            tag = %fourcc(base.container_tag()),
            expected = %fourcc(RTKIT_OS_TAG),
            "Unexpected ftab tag, continuing anyway"
        );
    }

    if ctx.identity.has_component(recovery_component) {
        let recovery_data = extract_component(ctx, recovery_component)?;
        let recovery = Ftab::parse(&recovery_data)
            .with_context(|| format!("failed to parse '{recovery_component}' component data"))?;
        if recovery.container_tag() != RTKIT_OS_TAG {
            warn!(
                tag = %fourcc(recovery.container_tag()),
                expected = %fourcc(RTKIT_OS_TAG),
                "Unexpected ftab tag, continuing anyway"
            );
        }
        match recovery.entry(RECOVERY_OS_ENTRY) {
            Some(entry) => base.set_entry(RECOVERY_OS_ENTRY, entry),
            None => warn!("No recovery entry in recovery ftab, this will probably break things"),
        }
    } else {
        info!(component = recovery_component, "Build identity does not have a recovery component");
    }

    Ok(base.to_bytes())
}

fn rose_firmware_data(ctx: &UpdaterContext<'_>, info: &Dictionary) -> Result<Dictionary> {
    let mut response = ctx
        .tickets
        .fetch_rose(ctx.identity, info, ctx.image4_supported)?;
    let ftab = compose_rtkit_ftab(ctx, "Rap,RTKitOS", "Rap,RestoreRTKitOS")?;
    response.insert("FirmwareData".into(), Value::Data(ftab));
    Ok(response)
}

fn veridian_firmware_data(ctx: &UpdaterContext<'_>, info: &Dictionary) -> Result<Dictionary> {
    const COMPONENT: &str = "BMU,FirmwareMap";

    let mut response = ctx.tickets.fetch_veridian(ctx.identity, info)?;
    let component = extract_component(ctx, COMPONENT)?;
    let mut fw_map = Value::from_reader(Cursor::new(&component))
        .ok()
        .and_then(Value::into_dictionary)
        .ok_or_else(|| anyhow!("unable to parse '{COMPONENT}' component data as plist"))?;

    let digest = ctx
        .identity
        .component_digest(COMPONENT)
        .ok_or_else(|| anyhow!("unable to get digest for '{COMPONENT}' component"))?;
    fw_map.insert("fw_map_digest".into(), digest.clone());

    let mut serialized = Vec::new();
    Value::Dictionary(fw_map).to_writer_binary(&mut serialized)?;
    response.insert("FirmwareData".into(), Value::Data(serialized));
    Ok(response)
}

fn tcon_firmware_data(ctx: &UpdaterContext<'_>, info: &Dictionary) -> Result<Dictionary> {
    let mut response = ctx.tickets.fetch_tcon(ctx.identity, info)?;
    let component = extract_component(ctx, "Baobab,TCON")?;
    response.insert("FirmwareData".into(), Value::Data(component));
    Ok(response)
}

fn timer_firmware_data(ctx: &UpdaterContext<'_>, info: &Dictionary) -> Result<Dictionary> {
    let (mut response, _ticket_name, tag) =
        ctx.tickets
            .fetch_timer(ctx.identity, info, ctx.image4_supported)?;
    let ftab = compose_rtkit_ftab(
        ctx,
        &format!("Timer,RTKitOS,{tag}"),
        &format!("Timer,RestoreRTKitOS,{tag}"),
    )?;
    response.insert("FirmwareData".into(), Value::Data(ftab));
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_updater_name_dispatch() {
        let empty = Dictionary::new();
        assert_eq!(UpdaterKind::from_updater_name("SE", &empty), Some(UpdaterKind::Se));
        assert_eq!(UpdaterKind::from_updater_name("Rose", &empty), Some(UpdaterKind::Rose));
        assert_eq!(UpdaterKind::from_updater_name("T200", &empty), Some(UpdaterKind::Veridian));
        assert_eq!(UpdaterKind::from_updater_name("AppleTCON", &empty), Some(UpdaterKind::AppleTcon));
        assert_eq!(
            UpdaterKind::from_updater_name("AppleTypeCRetimer", &empty),
            Some(UpdaterKind::Timer)
        );
        assert_eq!(UpdaterKind::from_updater_name("Mystery", &empty), None);
    }

    #[test]
    fn test_savage_request_with_yonkers_info_is_yonkers() {
        let mut info = Dictionary::new();
        info.insert("YonkersDeviceInfo".into(), Value::Dictionary(Dictionary::new()));
        assert_eq!(
            UpdaterKind::from_updater_name("Savage", &info),
            Some(UpdaterKind::Yonkers)
        );
        assert_eq!(
            UpdaterKind::from_updater_name("Savage", &Dictionary::new()),
            Some(UpdaterKind::Savage)
        );
    }

    #[test]
    fn test_savage_prefix_layout() {
        let out = savage_prefix(&[0xaa; 24]);
        assert_eq!(out.len(), 40);
        assert_eq!(&out[0..4], &[0, 0, 0, 0]);
        assert_eq!(LittleEndian::read_u32(&out[4..8]), 24);
        assert_eq!(&out[8..16], &[0u8; 8]);
        assert_eq!(&out[16..], &[0xaa; 24][..]);
    }

    fn identity_with_components(components: &[&str]) -> BuildIdentity {
        let mut manifest = Dictionary::new();
        for comp in components {
            let mut info = Dictionary::new();
            info.insert("Path".into(), Value::String(format!("Firmware/{comp}.bin")));
            let mut entry = Dictionary::new();
            entry.insert("Info".into(), Value::Dictionary(info));
            manifest.insert((*comp).to_string(), Value::Dictionary(entry));
        }
        let mut dict = Dictionary::new();
        dict.insert("Manifest".into(), Value::Dictionary(manifest));
        BuildIdentity::from_dictionary(dict)
    }

    #[test]
    fn test_se_component_selection() {
        let identity = identity_with_components(&["SE,Firmware", "SE,UpdatePayload"]);

        let mut info = Dictionary::new();
        info.insert("SE,ChipID".into(), Value::Integer(0x20211.into()));
        assert_eq!(se_component_name(&identity, &info).unwrap(), "SE,Firmware");

        let mut info = Dictionary::new();
        info.insert("SE,ChipID".into(), Value::Integer(0x73.into()));
        assert_eq!(se_component_name(&identity, &info).unwrap(), "SE,UpdatePayload");

        // unknown chip falls back to whatever the identity carries
        let mut info = Dictionary::new();
        info.insert("SE,ChipID".into(), Value::Integer(0x9999.into()));
        assert_eq!(se_component_name(&identity, &info).unwrap(), "SE,UpdatePayload");

        let only_fw = identity_with_components(&["SE,Firmware"]);
        assert_eq!(se_component_name(&only_fw, &info).unwrap(), "SE,Firmware");

        let neither = identity_with_components(&[]);
        assert!(se_component_name(&neither, &info).is_err());
    }
}
