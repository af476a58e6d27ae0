//! Anneal Core - Shared types for the restore session driver
//!
//! This crate provides the pieces of the restore pipeline that do not talk
//! to a device:
//! - Firmware archive access (listing, streaming and whole-file extraction)
//! - Build manifest / build identity helpers
//! - Progress and status code mapping for the restore protocol
//! - Baseband container formats (MBN, FLS) and the baseband repack pass
//! - Tagged firmware tables (FTAB) for RTKit payloads
//! - ODC cpio record encoding for the bootability stream

pub mod archive;
pub mod baseband;
pub mod cpio;
pub mod fls;
pub mod ftab;
pub mod manifest;
pub mod mbn;
pub mod progress;

pub use archive::{ArchiveError, EntryStat, FirmwareArchive};
pub use baseband::{filename_for_element, sign_baseband_archive, BasebandError};
pub use ftab::{Ftab, FtabError};
pub use manifest::{BuildIdentity, BuildManifest, ManifestError, RestoreVariant};
pub use progress::{adapt_operation, operation_label, RestoreStep, StatusCode};
