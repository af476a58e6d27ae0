//! Build manifest and build identity helpers
//!
//! The firmware archive carries a build manifest listing one build identity
//! per device class / install variant pair. The restore driver selects one
//! identity up front and resolves every component path through it.

use std::io::Cursor;

use plist::{Dictionary, Value};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("manifest is not a valid property list")]
    Parse(#[from] plist::Error),
    #[error("manifest has no '{0}' node")]
    MissingNode(&'static str),
    #[error("no build identity for model '{model}' variant '{variant}'")]
    NoMatchingIdentity { model: String, variant: String },
    #[error("component '{0}' not present in build identity")]
    UnknownComponent(String),
    #[error("component '{0}' has no Info.Path")]
    NoComponentPath(String),
}

/// Install variant selecting a build identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreVariant {
    Erase,
    Upgrade,
    MacosRecovery,
}

impl RestoreVariant {
    /// The variant string used inside build manifests.
    pub fn label(&self) -> &'static str {
        match self {
            RestoreVariant::Erase => "Customer Erase Install (IPSW)",
            RestoreVariant::Upgrade => "Customer Upgrade Install (IPSW)",
            RestoreVariant::MacosRecovery => "macOS Customer",
        }
    }
}

/// Top-level build manifest.
pub struct BuildManifest {
    root: Dictionary,
}

impl BuildManifest {
    pub fn from_bytes(data: &[u8]) -> Result<Self, ManifestError> {
        let value = Value::from_reader(Cursor::new(data))?;
        let root = value
            .into_dictionary()
            .ok_or(ManifestError::MissingNode("BuildManifest"))?;
        Ok(Self { root })
    }

    pub fn product_version(&self) -> Option<&str> {
        self.root.get("ProductVersion").and_then(Value::as_string)
    }

    pub fn unique_build_id(&self) -> Option<&[u8]> {
        self.root
            .get("UniqueBuildID")
            .and_then(Value::as_data)
    }

    /// Select the build identity matching a hardware model and variant.
    pub fn identity_for(
        &self,
        hardware_model: &str,
        variant: RestoreVariant,
    ) -> Result<BuildIdentity, ManifestError> {
        let identities = self
            .root
            .get("BuildIdentities")
            .and_then(Value::as_array)
            .ok_or(ManifestError::MissingNode("BuildIdentities"))?;

        for identity in identities {
            let Some(dict) = identity.as_dictionary() else {
                continue;
            };
            let Some(info) = dict.get("Info").and_then(Value::as_dictionary) else {
                continue;
            };
            let class_matches = info
                .get("DeviceClass")
                .and_then(Value::as_string)
                .map(|c| c.eq_ignore_ascii_case(hardware_model))
                .unwrap_or(false);
            let variant_matches = info
                .get("Variant")
                .and_then(Value::as_string)
                .map(|v| v.contains(variant.label()))
                .unwrap_or(false);
            if class_matches && variant_matches {
                debug!(model = hardware_model, variant = variant.label(), "Selected build identity");
                return Ok(BuildIdentity { dict: dict.clone() });
            }
        }

        Err(ManifestError::NoMatchingIdentity {
            model: hardware_model.to_string(),
            variant: variant.label().to_string(),
        })
    }
}

/// One build identity out of the manifest.
#[derive(Debug, Clone)]
pub struct BuildIdentity {
    dict: Dictionary,
}

impl BuildIdentity {
    pub fn from_dictionary(dict: Dictionary) -> Self {
        Self { dict }
    }

    pub fn as_dictionary(&self) -> &Dictionary {
        &self.dict
    }

    pub fn to_value(&self) -> Value {
        Value::Dictionary(self.dict.clone())
    }

    fn info(&self) -> Option<&Dictionary> {
        self.dict.get("Info").and_then(Value::as_dictionary)
    }

    fn manifest(&self) -> Option<&Dictionary> {
        self.dict.get("Manifest").and_then(Value::as_dictionary)
    }

    pub fn info_value(&self, key: &str) -> Option<&Value> {
        self.info().and_then(|i| i.get(key))
    }

    pub fn device_class(&self) -> Option<&str> {
        self.info_value("DeviceClass").and_then(Value::as_string)
    }

    pub fn macos_variant(&self) -> Option<&str> {
        self.info_value("MacOSVariant").and_then(Value::as_string)
    }

    pub fn fdr_support(&self) -> bool {
        self.info_value("FDRSupport")
            .and_then(Value::as_boolean)
            .unwrap_or(false)
    }

    pub fn minimum_system_partition(&self) -> Option<&Value> {
        self.info_value("MinimumSystemPartition")
    }

    pub fn system_partition_padding(&self) -> Option<&Value> {
        self.info_value("SystemPartitionPadding")
    }

    pub fn has_component(&self, component: &str) -> bool {
        self.manifest()
            .map(|m| m.contains_key(component))
            .unwrap_or(false)
    }

    pub fn manifest_entry(&self, component: &str) -> Option<&Dictionary> {
        self.manifest()
            .and_then(|m| m.get(component))
            .and_then(Value::as_dictionary)
    }

    /// A value under `Manifest.<component>.Info.<key>`.
    pub fn component_info_value(&self, component: &str, key: &str) -> Option<&Value> {
        self.manifest_entry(component)
            .and_then(|e| e.get("Info"))
            .and_then(Value::as_dictionary)
            .and_then(|i| i.get(key))
    }

    pub fn component_digest(&self, component: &str) -> Option<&Value> {
        self.manifest_entry(component).and_then(|e| e.get("Digest"))
    }

    /// The archive path of a component per the build identity.
    pub fn component_path(&self, component: &str) -> Result<String, ManifestError> {
        if !self.has_component(component) {
            return Err(ManifestError::UnknownComponent(component.to_string()));
        }
        self.component_info_value(component, "Path")
            .and_then(Value::as_string)
            .map(str::to_string)
            .ok_or_else(|| ManifestError::NoComponentPath(component.to_string()))
    }

    /// Whether a manifest entry carries a true `Info.<flag>`.
    fn component_flag(&self, entry: &Dictionary, flag: &str) -> bool {
        entry
            .get("Info")
            .and_then(Value::as_dictionary)
            .and_then(|i| i.get(flag))
            .and_then(Value::as_boolean)
            .unwrap_or(false)
    }

    /// Components whose `Info.<flag>` is true, as (name, path) pairs.
    pub fn components_with_flag(&self, flag: &str) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(manifest) = self.manifest() {
            for (name, entry) in manifest {
                let Some(entry) = entry.as_dictionary() else {
                    continue;
                };
                if !self.component_flag(entry, flag) {
                    continue;
                }
                if let Some(path) = entry
                    .get("Info")
                    .and_then(Value::as_dictionary)
                    .and_then(|i| i.get("Path"))
                    .and_then(Value::as_string)
                {
                    out.push((name.to_string(), path.to_string()));
                }
            }
        }
        out
    }

    /// Firmware files flashed through the NOR payload: every component with
    /// `IsFirmwarePayload`, or `IsSecondaryFirmwarePayload` when it is also
    /// loaded by iBoot.
    pub fn firmware_payloads(&self) -> Vec<(String, String)> {
        let mut out = Vec::new();
        if let Some(manifest) = self.manifest() {
            for (name, entry) in manifest {
                let Some(entry) = entry.as_dictionary() else {
                    continue;
                };
                let is_fw = self.component_flag(entry, "IsFirmwarePayload");
                let secondary = self.component_flag(entry, "IsSecondaryFirmwarePayload")
                    && self.component_flag(entry, "IsLoadedByiBoot");
                if !(is_fw || secondary) {
                    continue;
                }
                if let Some(path) = entry
                    .get("Info")
                    .and_then(Value::as_dictionary)
                    .and_then(|i| i.get("Path"))
                    .and_then(Value::as_string)
                {
                    out.push((name.to_string(), path.to_string()));
                }
            }
        }
        out
    }

    /// Archive path of the global AP ticket for this identity.
    pub fn global_ticket_path(&self) -> Result<String, ManifestError> {
        let variant = self
            .macos_variant()
            .ok_or(ManifestError::MissingNode("MacOSVariant"))?;
        let class = self
            .device_class()
            .ok_or(ManifestError::MissingNode("DeviceClass"))?;
        Ok(format!(
            "Firmware/Manifests/restore/{variant}/apticket.{class}.im4m"
        ))
    }
}

/// Map a firmware filename from the on-archive manifest file to its logical
/// component name.
pub fn component_name_for_filename(filename: &str) -> Option<&'static str> {
    const MAP: &[(&str, &str)] = &[
        ("LLB", "LLB"),
        ("iBoot", "iBoot"),
        ("DeviceTree", "DeviceTree"),
        ("applelogo", "AppleLogo"),
        ("liquiddetect", "Liquid"),
        ("lowpowermode", "LowPowerWallet0"),
        ("recoverymode", "RecoveryMode"),
        ("batterylow0", "BatteryLow0"),
        ("batterylow1", "BatteryLow1"),
        ("glyphcharging", "BatteryCharging"),
        ("glyphplugin", "BatteryPlugin"),
        ("batterycharging0", "BatteryCharging0"),
        ("batterycharging1", "BatteryCharging1"),
        ("batteryfull", "BatteryFull"),
        ("needservice", "NeedService"),
        ("SCAB", "SCAB"),
        ("sep-firmware", "RestoreSEP"),
    ];
    MAP.iter()
        .find(|(prefix, _)| filename.starts_with(prefix))
        .map(|(_, component)| *component)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn component(path: &str, flags: &[&str]) -> Value {
        let mut info = Dictionary::new();
        info.insert("Path".into(), Value::String(path.into()));
        for flag in flags {
            info.insert((*flag).into(), Value::Boolean(true));
        }
        let mut entry = Dictionary::new();
        entry.insert("Info".into(), Value::Dictionary(info));
        entry.insert("Digest".into(), Value::Data(vec![0xd1, 0xd2]));
        Value::Dictionary(entry)
    }

    fn identity(device_class: &str, variant: &str) -> Dictionary {
        let mut info = Dictionary::new();
        info.insert("DeviceClass".into(), Value::String(device_class.into()));
        info.insert("Variant".into(), Value::String(variant.into()));

        let mut manifest = Dictionary::new();
        manifest.insert(
            "LLB".into(),
            component("Firmware/all_flash/LLB.img4", &["IsFirmwarePayload"]),
        );
        manifest.insert(
            "iBoot".into(),
            component("Firmware/all_flash/iBoot.img4", &["IsFirmwarePayload"]),
        );
        manifest.insert(
            "KernelCache".into(),
            component("kernelcache.release", &[]),
        );
        manifest.insert(
            "AuxFirmware".into(),
            component(
                "Firmware/aux.img4",
                &["IsSecondaryFirmwarePayload", "IsLoadedByiBoot"],
            ),
        );
        manifest.insert(
            "AuxLate".into(),
            component("Firmware/aux_late.img4", &["IsSecondaryFirmwarePayload"]),
        );

        let mut dict = Dictionary::new();
        dict.insert("Info".into(), Value::Dictionary(info));
        dict.insert("Manifest".into(), Value::Dictionary(manifest));
        dict
    }

    fn manifest_with(identities: Vec<Dictionary>) -> BuildManifest {
        let mut root = Dictionary::new();
        root.insert(
            "BuildIdentities".into(),
            Value::Array(identities.into_iter().map(Value::Dictionary).collect()),
        );
        let mut buf = Vec::new();
        Value::Dictionary(root).to_writer_xml(&mut buf).unwrap();
        BuildManifest::from_bytes(&buf).unwrap()
    }

    #[test]
    fn test_identity_selection_by_model_and_variant() {
        let manifest = manifest_with(vec![
            identity("n71ap", "Customer Upgrade Install (IPSW)"),
            identity("n71ap", "Customer Erase Install (IPSW)"),
        ]);

        let ident = manifest.identity_for("N71AP", RestoreVariant::Erase).unwrap();
        assert_eq!(
            ident.info_value("Variant").and_then(Value::as_string),
            Some("Customer Erase Install (IPSW)")
        );

        let err = manifest.identity_for("n66ap", RestoreVariant::Erase).unwrap_err();
        assert!(matches!(err, ManifestError::NoMatchingIdentity { .. }));
    }

    #[test]
    fn test_component_path_resolution() {
        let ident = BuildIdentity::from_dictionary(identity("n71ap", "Customer Erase Install (IPSW)"));
        assert_eq!(
            ident.component_path("LLB").unwrap(),
            "Firmware/all_flash/LLB.img4"
        );
        assert!(matches!(
            ident.component_path("SEP").unwrap_err(),
            ManifestError::UnknownComponent(_)
        ));
    }

    #[test]
    fn test_firmware_payloads_selects_flagged_components() {
        let ident = BuildIdentity::from_dictionary(identity("n71ap", "Customer Erase Install (IPSW)"));
        let mut names: Vec<_> = ident
            .firmware_payloads()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();

        // KernelCache has no firmware flag; AuxLate is secondary but not
        // loaded by iBoot, so neither may appear.
        assert_eq!(names, vec!["AuxFirmware", "LLB", "iBoot"]);
    }

    #[test]
    fn test_global_ticket_path() {
        let mut dict = identity("j313ap", "macOS Customer");
        dict.get_mut("Info")
            .and_then(Value::as_dictionary_mut)
            .unwrap()
            .insert("MacOSVariant".into(), Value::String("Default".into()));
        let ident = BuildIdentity::from_dictionary(dict);
        assert_eq!(
            ident.global_ticket_path().unwrap(),
            "Firmware/Manifests/restore/Default/apticket.j313ap.im4m"
        );
    }

    #[test]
    fn test_component_name_for_filename() {
        assert_eq!(component_name_for_filename("iBoot.n71.RELEASE.im4p"), Some("iBoot"));
        assert_eq!(
            component_name_for_filename("sep-firmware.n71.RELEASE.im4p"),
            Some("RestoreSEP")
        );
        assert_eq!(component_name_for_filename("unknown.bin"), None);
    }
}
