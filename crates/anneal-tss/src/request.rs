//! Ticket request construction
//!
//! Requests to the ticket authority are plist dictionaries: a handful of
//! client headers, common device-identifying tags, and one tag set per
//! firmware subsystem. Subsystem tag sets are merged out of a parameters
//! dictionary that combines manifest-derived values with the info
//! dictionary the device sent along with its data request.

use anneal_core::manifest::BuildIdentity;
use plist::{Dictionary, Value};
use tracing::debug;
use uuid::Uuid;

const CLIENT_VERSION: &str = "libauthinstall-850.0.2";

/// Builder for one ticket authority request.
#[derive(Debug)]
pub struct TssRequest {
    dict: Dictionary,
}

impl Default for TssRequest {
    fn default() -> Self {
        Self::new()
    }
}

impl TssRequest {
    pub fn new() -> Self {
        let mut dict = Dictionary::new();
        dict.insert("@HostPlatformInfo".into(), Value::String("mac".into()));
        dict.insert("@VersionInfo".into(), Value::String(CLIENT_VERSION.into()));
        dict.insert(
            "@UUID".into(),
            Value::String(Uuid::new_v4().to_string().to_uppercase()),
        );
        Self { dict }
    }

    pub fn into_dictionary(self) -> Dictionary {
        self.dict
    }

    fn copy_if_present(&mut self, params: &Dictionary, key: &str) {
        if let Some(value) = params.get(key) {
            self.dict.insert(key.to_string(), value.clone());
        }
    }

    fn copy_with_prefix(&mut self, params: &Dictionary, prefix: &str) {
        for (key, value) in params {
            if key.starts_with(prefix) {
                self.dict.insert(key.to_string(), value.clone());
            }
        }
    }

    pub fn set(&mut self, key: &str, value: Value) {
        self.dict.insert(key.to_string(), value);
    }

    /// Device-identifying tags shared by every subsystem request.
    pub fn add_common_tags(&mut self, params: &Dictionary) {
        for key in [
            "UniqueBuildID",
            "ApChipID",
            "ApBoardID",
            "ApSecurityDomain",
            "ApECID",
            "ApNonce",
            "ApProductionMode",
            "ApSecurityMode",
            "ApSupportsImg4",
        ] {
            self.copy_if_present(params, key);
        }
    }

    /// Baseband subsystem tags. `@BBTicket` marks the request as a baseband
    /// signing request.
    pub fn add_baseband_tags(&mut self, params: &Dictionary) {
        self.dict.insert("@BBTicket".into(), Value::Boolean(true));
        self.copy_with_prefix(params, "Bb");
        if let Some(bbfw) = params
            .get("Manifest")
            .and_then(Value::as_dictionary)
            .and_then(|m| m.get("BasebandFirmware"))
        {
            self.dict
                .insert("BasebandFirmware".into(), strip_info(bbfw));
        }
    }

    pub fn add_se_tags(&mut self, params: &Dictionary) {
        self.dict.insert("@SE,Ticket".into(), Value::Boolean(true));
        self.copy_with_prefix(params, "SE,");
    }

    /// Savage tags; returns the patch component this device needs.
    pub fn add_savage_tags(&mut self, params: &Dictionary) -> Option<String> {
        self.dict
            .insert("@Savage,Ticket".into(), Value::Boolean(true));
        self.copy_with_prefix(params, "Savage,");

        let production = params
            .get("Savage,ProductionMode")
            .and_then(Value::as_boolean)
            .unwrap_or(false);
        let revision = params
            .get("Savage,Revision")
            .and_then(Value::as_data)
            .and_then(|d| d.first().copied())
            .unwrap_or(0);
        let board = if revision >= 0x02 { "B2" } else { "B0" };
        let mode = if production { "Prod" } else { "Dev" };
        let comp_name = format!("Savage,{board}-{mode}-Patch");
        debug!(component = %comp_name, "Selected Savage patch component");
        Some(comp_name)
    }

    /// Yonkers tags; returns the patch component this device needs.
    pub fn add_yonkers_tags(&mut self, params: &Dictionary) -> Option<String> {
        self.dict
            .insert("@Yonkers,Ticket".into(), Value::Boolean(true));
        self.copy_with_prefix(params, "Yonkers,");

        let production = params
            .get("Yonkers,ProductionMode")
            .and_then(Value::as_boolean)
            .unwrap_or(false);
        let mode = if production { "Prod" } else { "Dev" };
        let comp_name = format!("Yonkers,SysTopPatch-{mode}");
        debug!(component = %comp_name, "Selected Yonkers patch component");
        Some(comp_name)
    }

    pub fn add_rose_tags(&mut self, params: &Dictionary) {
        self.dict.insert("@Rap,Ticket".into(), Value::Boolean(true));
        self.copy_with_prefix(params, "Rap,");
        for key in ["ApProductionMode", "ApSecurityMode", "ApSupportsImg4"] {
            self.copy_if_present(params, key);
        }
    }

    pub fn add_veridian_tags(&mut self, params: &Dictionary) {
        self.dict.insert("@BMU,Ticket".into(), Value::Boolean(true));
        self.copy_with_prefix(params, "BMU,");
    }

    pub fn add_tcon_tags(&mut self, params: &Dictionary) {
        self.dict
            .insert("@Baobab,Ticket".into(), Value::Boolean(true));
        self.copy_with_prefix(params, "Baobab,");
    }

    /// Timer tags. The per-tag parameter names (`Timer,ChipID,<n>` and
    /// friends) are expected to already be present in `params`; the ticket
    /// name marker comes from the device info.
    pub fn add_timer_tags(&mut self, params: &Dictionary, ticket_name: &str) {
        self.dict
            .insert(format!("@{ticket_name}"), Value::Boolean(true));
        self.copy_with_prefix(params, "Timer,");
        for key in ["TagNumber", "TicketName", "ApProductionMode", "ApSecurityMode", "ApSupportsImg4"] {
            self.copy_if_present(params, key);
        }
    }
}

/// Copy a manifest entry without its host-side `Info` dictionary.
fn strip_info(entry: &Value) -> Value {
    match entry.as_dictionary() {
        Some(dict) => {
            let mut out = dict.clone();
            out.remove("Info");
            Value::Dictionary(out)
        }
        None => entry.clone(),
    }
}

/// Seed a parameters dictionary from the selected build identity: the
/// device-identifying top-level tags plus the whole component manifest.
pub fn parameters_from_manifest(params: &mut Dictionary, identity: &BuildIdentity) {
    let dict = identity.as_dictionary();
    for key in [
        "ApBoardID",
        "ApChipID",
        "ApSecurityDomain",
        "BbChipID",
        "BbProvisioningManifestKeyHash",
        "BbActivationManifestKeyHash",
        "BbFDRSecurityKeyHash",
        "BbSkeyId",
        "UniqueBuildID",
        "PearlCertificationRootPub",
    ] {
        if let Some(value) = dict.get(key) {
            params.insert(key.to_string(), value.clone());
        }
    }
    if let Some(manifest) = dict.get("Manifest") {
        params.insert("Manifest".to_string(), manifest.clone());
    }
}

/// Merge `extra` into `params`, overwriting existing keys.
pub fn merge_parameters(params: &mut Dictionary, extra: &Dictionary) {
    for (key, value) in extra {
        params.insert(key.to_string(), value.clone());
    }
}
