//! Restore options assembly
//!
//! The options dictionary seeds `StartRestore` and tells the restore daemon
//! what the host is prepared to do. Most of it is fixed capability
//! declarations; the rest is derived from the build identity, preflight
//! info, and the caller's erase/update choice. Desktop-OS builds get a
//! different option block than mobile builds.

use anneal_core::manifest::BuildIdentity;
use plist::{Dictionary, Value};

/// Caller-controlled inputs. The session UUID is an input so that option
/// assembly stays a pure function of its arguments.
#[derive(Debug)]
pub struct OptionsInputs<'a> {
    pub identity: &'a BuildIdentity,
    pub preflight_info: Option<&'a Dictionary>,
    pub restore_boot_args: Option<&'a str>,
    pub erase: bool,
    pub session_uuid: &'a str,
}

fn bool_opt(dict: &mut Dictionary, key: &str, value: bool) {
    dict.insert(key.to_string(), Value::Boolean(value));
}

fn uint_opt(dict: &mut Dictionary, key: &str, value: u64) {
    dict.insert(key.to_string(), Value::Integer(value.into()));
}

fn string_opt(dict: &mut Dictionary, key: &str, value: &str) {
    dict.insert(key.to_string(), Value::String(value.to_string()));
}

/// Build the `RestoreOptions` dictionary.
pub fn build_restore_options(inputs: &OptionsInputs) -> Dictionary {
    let identity = inputs.identity;
    let mut opts = Dictionary::new();

    uint_opt(&mut opts, "AutoBootDelay", 0);

    if let Some(preflight) = inputs.preflight_info {
        let mut updater_state = preflight.clone();
        updater_state.remove("FusingStatus");
        updater_state.remove("PkHash");
        opts.insert("BBUpdaterState".into(), Value::Dictionary(updater_state));

        if let Some(nonce) = preflight.get("Nonce") {
            opts.insert("BasebandNonce".into(), nonce.clone());
        }
    }

    opts.insert(
        "SupportedDataTypes".into(),
        Value::Dictionary(supported_data_types()),
    );
    opts.insert(
        "SupportedMessageTypes".into(),
        Value::Dictionary(supported_message_types()),
    );

    if let Some(macos_variant) = identity.macos_variant() {
        bool_opt(&mut opts, "AddSystemPartitionPadding", true);
        bool_opt(&mut opts, "AllowUntetheredRestore", false);
        bool_opt(&mut opts, "AuthInstallEnableSso", false);
        string_opt(&mut opts, "AuthInstallRecoveryOSVariant", macos_variant);
        string_opt(
            &mut opts,
            "AuthInstallRestoreBehavior",
            if inputs.erase { "Erase" } else { "Update" },
        );
        uint_opt(&mut opts, "AutoBootDelay", 0);
        bool_opt(&mut opts, "BasebandUpdaterOutputPath", true);
        bool_opt(&mut opts, "DisableUserAuthentication", true);
        bool_opt(&mut opts, "FitSystemPartitionToContent", true);
        bool_opt(&mut opts, "FlashNOR", true);
        bool_opt(&mut opts, "FormatForAPFS", true);
        bool_opt(&mut opts, "FormatForLwVM", false);
        bool_opt(&mut opts, "InstallDiags", false);
        bool_opt(&mut opts, "InstallRecoveryOS", true);
        bool_opt(&mut opts, "MacOSSwapPerformed", true);
        bool_opt(&mut opts, "MacOSVariantPresent", true);
        uint_opt(&mut opts, "MinimumBatteryVoltage", 0);
        bool_opt(&mut opts, "RecoveryOSUnpack", true);
        bool_opt(&mut opts, "ShouldRestoreSystemImage", true);
        bool_opt(&mut opts, "SkipPreflightPersonalization", false);
        bool_opt(&mut opts, "UpdateBaseband", true);
        uint_opt(&mut opts, "recoveryOSPartitionSize", 58201);
        if let Some(msp) = identity.minimum_system_partition() {
            opts.insert("SystemPartitionSize".into(), msp.clone());
        }
    } else {
        string_opt(&mut opts, "BootImageType", "UserOrInternal");
        string_opt(&mut opts, "DFUFileType", "RELEASE");
        bool_opt(&mut opts, "DataImage", false);
        string_opt(&mut opts, "FirmwareDirectory", ".");
        bool_opt(&mut opts, "FlashNOR", true);
        string_opt(&mut opts, "KernelCacheType", "Release");
        string_opt(&mut opts, "NORImageType", "production");
        string_opt(&mut opts, "RestoreBundlePath", "/tmp/Per2.tmp");
        string_opt(&mut opts, "SystemImageType", "User");
        bool_opt(&mut opts, "UpdateBaseband", false);
        if let Some(capacity) = identity.component_info_value("SEP", "RequiredCapacity") {
            if capacity.as_string().is_some() {
                opts.insert("TZ0RequiredCapacity".into(), capacity.clone());
            }
        }
        // mandatory on newer builds to allow restore from normal mode
        bool_opt(&mut opts, "PersonalizedDuringPreflight", true);
    }

    bool_opt(&mut opts, "RootToInstall", false);
    string_opt(&mut opts, "UUID", inputs.session_uuid);
    bool_opt(&mut opts, "CreateFilesystemPartitions", true);
    bool_opt(&mut opts, "SystemImage", true);
    if let Some(boot_args) = inputs.restore_boot_args {
        string_opt(&mut opts, "RestoreBootArgs", boot_args);
    }

    let padding = match identity.system_partition_padding() {
        Some(padding) => padding.clone(),
        None => {
            let mut padding = Dictionary::new();
            padding.insert("128".into(), Value::Integer(1280.into()));
            padding.insert("16".into(), Value::Integer(160.into()));
            padding.insert("32".into(), Value::Integer(320.into()));
            padding.insert("64".into(), Value::Integer(640.into()));
            padding.insert("8".into(), Value::Integer(80.into()));
            Value::Dictionary(padding)
        }
    };
    opts.insert("SystemPartitionPadding".into(), padding);

    opts
}

fn capability_table(entries: &[(&str, bool)]) -> Dictionary {
    let mut dict = Dictionary::new();
    for (key, value) in entries {
        dict.insert((*key).to_string(), Value::Boolean(*value));
    }
    dict
}

/// Fixed data-type capability declarations.
pub fn supported_data_types() -> Dictionary {
    capability_table(&[
        ("BasebandBootData", false),
        ("BasebandData", false),
        ("BasebandStackData", false),
        ("BasebandUpdaterOutputData", false),
        ("BootabilityBundle", false),
        ("BuildIdentityDict", false),
        ("BuildIdentityDictV2", false),
        ("DataType", false),
        ("DiagData", false),
        ("EANData", false),
        ("FDRMemoryCommit", false),
        ("FDRTrustData", false),
        ("FUDData", false),
        ("FileData", false),
        ("FileDataDone", false),
        ("FirmwareUpdaterData", false),
        ("GrapeFWData", false),
        ("HPMFWData", false),
        ("HostSystemTime", true),
        ("KernelCache", false),
        ("NORData", false),
        ("NitrogenFWData", true),
        ("OpalFWData", false),
        ("OverlayRootDataCount", false),
        ("OverlayRootDataForKey", true),
        ("PeppyFWData", true),
        ("PersonalizedBootObjectV3", false),
        ("PersonalizedData", true),
        ("ProvisioningData", false),
        ("RamdiskFWData", true),
        ("RecoveryOSASRImage", true),
        ("RecoveryOSAppleLogo", true),
        ("RecoveryOSDeviceTree", true),
        ("RecoveryOSFileAssetImage", true),
        ("RecoveryOSIBEC", true),
        ("RecoveryOSIBootFWFilesImages", true),
        ("RecoveryOSImage", true),
        ("RecoveryOSKernelCache", true),
        ("RecoveryOSLocalPolicy", true),
        ("RecoveryOSOverlayRootDataCount", false),
        ("RecoveryOSRootTicketData", true),
        ("RecoveryOSStaticTrustCache", true),
        ("RecoveryOSVersionData", true),
        ("RootData", false),
        ("RootTicket", false),
        ("S3EOverride", false),
        ("SourceBootObjectV3", false),
        ("SourceBootObjectV4", false),
        ("SsoServiceTicket", false),
        ("StockholmPostflight", false),
        ("SystemImageCanonicalMetadata", false),
        ("SystemImageData", false),
        ("SystemImageRootHash", false),
        ("USBCFWData", false),
        ("USBCOverride", false),
    ])
}

/// Fixed message-type capability declarations.
pub fn supported_message_types() -> Dictionary {
    capability_table(&[
        ("BBUpdateStatusMsg", false),
        ("CheckpointMsg", true),
        ("DataRequestMsg", false),
        ("FDRSubmit", true),
        ("MsgType", false),
        ("PreviousRestoreLogMsg", false),
        ("ProgressMsg", false),
        ("ProvisioningAck", false),
        ("ProvisioningInfo", false),
        ("ProvisioningStatusMsg", false),
        ("ReceivedFinalStatusMsg", false),
        ("RestoredCrash", true),
        ("StatusMsg", false),
    ])
}
