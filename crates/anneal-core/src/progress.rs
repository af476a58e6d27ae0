//! Progress and status mapping for the restore protocol
//!
//! The restore daemon reports numeric operation codes; this module turns
//! them into user-visible labels and progress-sink stages, and classifies
//! the status codes carried by terminal status messages.

/// First protocol version that uses the renumbered operation table.
pub const RENUMBERED_PROTOCOL_VERSION: u64 = 14;

const CREATE_PARTITION_MAP: u64 = 11;
const CREATE_FILESYSTEM: u64 = 12;
const RESTORE_IMAGE: u64 = 13;
const VERIFY_RESTORE: u64 = 14;
const CHECK_FILESYSTEMS: u64 = 15;
const MOUNT_FILESYSTEMS: u64 = 16;
const FIXUP_VAR: u64 = 17;
const FLASH_FIRMWARE: u64 = 18;
const UPDATE_BASEBAND: u64 = 19;
const SET_BOOT_STAGE: u64 = 20;
const REBOOT_DEVICE: u64 = 21;
const SHUTDOWN_DEVICE: u64 = 22;
const TURN_ON_ACCESSORY_POWER: u64 = 23;
const CLEAR_BOOTARGS: u64 = 24;
const MODIFY_BOOTARGS: u64 = 25;
const INSTALL_ROOT: u64 = 26;
const INSTALL_KERNELCACHE: u64 = 27;
const WAIT_FOR_NAND: u64 = 28;
const UNMOUNT_FILESYSTEMS: u64 = 29;
const SET_DATETIME: u64 = 30;
const EXEC_IBOOT: u64 = 31;
const FINALIZE_NAND_EPOCH_UPDATE: u64 = 32;
const CHECK_INAPPR_BOOT_PARTITIONS: u64 = 33;
const CREATE_FACTORY_RESTORE_MARKER: u64 = 34;
const LOAD_FIRMWARE: u64 = 35;
const REQUESTING_FUD_DATA: u64 = 36;
const REMOVING_ACTIVATION_RECORD: u64 = 37;
const CHECK_BATTERY_VOLTAGE: u64 = 38;
const WAIT_BATTERY_CHARGE: u64 = 39;
const CLOSE_MODEM_TICKETS: u64 = 40;
const MIGRATE_DATA: u64 = 41;
const WIPE_STORAGE_DEVICE: u64 = 42;
const SEND_APPLE_LOGO: u64 = 43;
const CHECK_LOGS: u64 = 44;
const CLEAR_NVRAM: u64 = 46;
const PREPARE_BASEBAND_UPDATE: u64 = 47;
const UPDATE_GAS_GAUGE: u64 = 48;
const BOOT_BASEBAND: u64 = 49;
const CREATE_SYSTEM_KEYBAG: u64 = 50;
const UPDATE_IR_MCU_FIRMWARE: u64 = 51;
const RESIZE_SYSTEM_PARTITION: u64 = 52;
const COLLECTING_UPDATER_OUTPUT: u64 = 53;
const PAIR_STOCKHOLM: u64 = 54;
const UPDATE_STOCKHOLM: u64 = 55;
const UPDATE_SWDHID: u64 = 56;
const CERTIFY_SEP: u64 = 57;
const UPDATE_NAND_FIRMWARE: u64 = 58;
const UPDATE_SE_FIRMWARE: u64 = 59;
const UPDATE_SAVAGE: u64 = 60;
const INSTALLING_DEVICETREE: u64 = 61;
const CERTIFY_SAVAGE: u64 = 62;
const SUBMITTING_PROVINFO: u64 = 63;
const CERTIFY_YONKERS: u64 = 64;
const UPDATE_ROSE: u64 = 65;
const UPDATE_VERIDIAN: u64 = 66;
const CREATING_PROTECTED_VOLUME: u64 = 67;
const RESIZING_MAIN_FS_PARTITION: u64 = 68;
const CREATING_RECOVERY_OS_VOLUME: u64 = 69;
const INSTALLING_RECOVERY_OS_FILES: u64 = 70;
const INSTALLING_RECOVERY_OS_IMAGE: u64 = 71;
const REQUESTING_EAN_DATA: u64 = 74;
const SEALING_SYSTEM_VOLUME: u64 = 77;
const UPDATING_APPLETCON: u64 = 81;

/// Stages reported to the progress sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestoreStep {
    Prepare,
    VerifyFilesystem,
    FlashFirmware,
    FlashBaseband,
    Fud,
    UploadFilesystem,
}

/// Adapt an operation code for the negotiated protocol version.
///
/// Protocol versions before 14 number every operation above 35 one lower
/// than the current table, so those codes are shifted up before lookup.
pub fn adapt_operation(operation: u64, protocol_version: u64) -> u64 {
    if protocol_version < RENUMBERED_PROTOCOL_VERSION && operation > 35 {
        operation + 1
    } else {
        operation
    }
}

/// Short description of an (already adapted) operation code.
pub fn operation_label(operation: u64) -> &'static str {
    match operation {
        CREATE_PARTITION_MAP => "Creating partition map",
        CREATE_FILESYSTEM => "Creating filesystem",
        RESTORE_IMAGE => "Restoring image",
        VERIFY_RESTORE => "Verifying restore",
        CHECK_FILESYSTEMS => "Checking filesystems",
        MOUNT_FILESYSTEMS => "Mounting filesystems",
        FIXUP_VAR => "Fixing up /var",
        FLASH_FIRMWARE => "Flashing firmware",
        UPDATE_BASEBAND => "Updating baseband",
        SET_BOOT_STAGE => "Setting boot stage",
        REBOOT_DEVICE => "Rebooting device",
        SHUTDOWN_DEVICE => "Shutdown device",
        TURN_ON_ACCESSORY_POWER => "Turning on accessory power",
        CLEAR_BOOTARGS => "Clearing persistent boot-args",
        MODIFY_BOOTARGS => "Modifying persistent boot-args",
        INSTALL_ROOT => "Installing root",
        INSTALL_KERNELCACHE => "Installing kernelcache",
        WAIT_FOR_NAND => "Waiting for NAND",
        UNMOUNT_FILESYSTEMS => "Unmounting filesystems",
        SET_DATETIME => "Setting date and time on device",
        EXEC_IBOOT => "Executing iBEC to bootstrap update",
        FINALIZE_NAND_EPOCH_UPDATE => "Finalizing NAND epoch update",
        CHECK_INAPPR_BOOT_PARTITIONS => "Checking for inappropriate bootable partitions",
        CREATE_FACTORY_RESTORE_MARKER => "Creating factory restore marker",
        LOAD_FIRMWARE => "Loading firmware data to flash",
        REQUESTING_FUD_DATA => "Requesting FUD data",
        REMOVING_ACTIVATION_RECORD => "Removing activation record",
        CHECK_BATTERY_VOLTAGE => "Checking battery voltage",
        WAIT_BATTERY_CHARGE => "Waiting for battery to charge",
        CLOSE_MODEM_TICKETS => "Closing modem tickets",
        MIGRATE_DATA => "Migrating data",
        WIPE_STORAGE_DEVICE => "Wiping storage device",
        SEND_APPLE_LOGO => "Sending Apple logo to device",
        CHECK_LOGS => "Checking for uncollected logs",
        CLEAR_NVRAM => "Clearing NVRAM",
        UPDATE_GAS_GAUGE => "Updating gas gauge software",
        PREPARE_BASEBAND_UPDATE => "Preparing for baseband update",
        BOOT_BASEBAND => "Booting the baseband",
        CREATE_SYSTEM_KEYBAG => "Creating system key bag",
        UPDATE_IR_MCU_FIRMWARE => "Updating IR MCU firmware",
        RESIZE_SYSTEM_PARTITION => "Resizing system partition",
        COLLECTING_UPDATER_OUTPUT => "Collecting updater output",
        PAIR_STOCKHOLM => "Pairing Stockholm",
        UPDATE_STOCKHOLM => "Updating Stockholm",
        UPDATE_SWDHID => "Updating SWDHID",
        CERTIFY_SEP => "Certifying SEP",
        UPDATE_NAND_FIRMWARE => "Updating NAND Firmware",
        UPDATE_SE_FIRMWARE => "Updating SE Firmware",
        UPDATE_SAVAGE => "Updating Savage",
        INSTALLING_DEVICETREE => "Installing DeviceTree",
        CERTIFY_SAVAGE => "Certifying Savage",
        SUBMITTING_PROVINFO => "Submitting Provinfo",
        CERTIFY_YONKERS => "Certifying Yonkers",
        UPDATE_ROSE => "Updating Rose",
        UPDATE_VERIDIAN => "Updating Veridian",
        CREATING_PROTECTED_VOLUME => "Creating Protected Volume",
        RESIZING_MAIN_FS_PARTITION => "Resizing Main Filesystem Partition",
        CREATING_RECOVERY_OS_VOLUME => "Creating Recovery OS Volume",
        INSTALLING_RECOVERY_OS_FILES => "Installing Recovery OS Files",
        INSTALLING_RECOVERY_OS_IMAGE => "Installing Recovery OS Image",
        REQUESTING_EAN_DATA => "Requesting EAN Data",
        SEALING_SYSTEM_VOLUME => "Sealing System Volume",
        UPDATING_APPLETCON => "Updating AppleTCON",
        _ => "Unknown operation",
    }
}

/// The progress-sink stage a (adapted) operation drives, if any.
pub fn step_for_operation(operation: u64) -> Option<RestoreStep> {
    match operation {
        VERIFY_RESTORE => Some(RestoreStep::VerifyFilesystem),
        FLASH_FIRMWARE => Some(RestoreStep::FlashFirmware),
        UPDATE_BASEBAND | UPDATE_IR_MCU_FIRMWARE => Some(RestoreStep::FlashBaseband),
        REQUESTING_FUD_DATA => Some(RestoreStep::Fud),
        _ => None,
    }
}

/// Classified status code from a `StatusMsg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Finished,
    VerificationError,
    DiskFailure,
    Fail,
    MountFailure,
    SepLoadFailure,
    FdrRecoveryFailure,
    BasebandUpdateFailure,
    Other(u64),
}

impl StatusCode {
    pub fn from_raw(value: u64) -> Self {
        match value {
            0 => StatusCode::Finished,
            u64::MAX => StatusCode::VerificationError,
            6 => StatusCode::DiskFailure,
            14 => StatusCode::Fail,
            27 => StatusCode::MountFailure,
            51 => StatusCode::SepLoadFailure,
            53 => StatusCode::FdrRecoveryFailure,
            1015 => StatusCode::BasebandUpdateFailure,
            other => StatusCode::Other(other),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            StatusCode::Finished => "Restore Finished",
            StatusCode::VerificationError => "Verification Error",
            StatusCode::DiskFailure => "Disk Failure",
            StatusCode::Fail => "Fail",
            StatusCode::MountFailure => "Failed to mount filesystems",
            StatusCode::SepLoadFailure => "Failed to load SEP Firmware",
            StatusCode::FdrRecoveryFailure => "Failed to recover FDR data",
            StatusCode::BasebandUpdateFailure => "Baseband Update Failed. Defective Unit?",
            StatusCode::Other(_) => "Unhandled status",
        }
    }

    pub fn is_terminal_success(&self) -> bool {
        matches!(self, StatusCode::Finished)
    }
}
