//! Baseband firmware repacking
//!
//! The baseband ticket response carries one `<Element>-Blob` signature per
//! firmware module plus the `BBTicket` itself. This pass rewrites the
//! baseband zip archive: each named module gets its signature blob
//! installed, everything that is not required is pruned, and the ticket is
//! embedded (inside `ebl.fls` for FLS stacks, as `bbticket.der` for MBN
//! stacks). The archive on disk is only replaced after the whole pass
//! succeeds.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use plist::{Dictionary, Value};
use thiserror::Error;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

use crate::fls::{FlsError, FlsFile};
use crate::mbn::{MbnError, MbnFile};

#[derive(Error, Debug)]
pub enum BasebandError {
    #[error("could not open baseband archive")]
    Archive(#[from] zip::result::ZipError),
    #[error("io error on baseband archive")]
    Io(#[from] std::io::Error),
    #[error("no BBTicket in baseband ticket response")]
    MissingTicket,
    #[error("no BasebandFirmware dictionary in baseband ticket response")]
    MissingFirmwareInfo,
    #[error("cannot match element '{0}' to a baseband firmware file name")]
    UnknownElement(String),
    #[error("'{filename}' (element '{element}') not present in baseband archive")]
    EntryMissing { element: String, filename: String },
    #[error("could not parse mbn module")]
    Mbn(#[from] MbnError),
    #[error("could not parse fls module")]
    Fls(#[from] FlsError),
}

/// Fixed element-to-filename table for the supported baseband generations.
pub fn filename_for_element(element: &str) -> Option<&'static str> {
    const MAP: &[(&str, &str)] = &[
        // ICE3
        ("RamPSI", "psi_ram.fls"),
        ("FlashPSI", "psi_flash.fls"),
        // Trek
        ("eDBL", "dbl.mbn"),
        ("RestoreDBL", "restoredbl.mbn"),
        // Phoenix / Mav4
        ("DBL", "dbl.mbn"),
        ("ENANDPRG", "ENPRG.mbn"),
        // Mav5
        ("RestoreSBL1", "restoresbl1.mbn"),
        ("SBL1", "sbl1.mbn"),
        // ICE16
        ("RestorePSI", "restorepsi.bin"),
        ("PSI", "psi_ram.bin"),
        // ICE19
        ("RestorePSI2", "restorepsi2.bin"),
        ("PSI2", "psi_ram2.bin"),
        // Mav20
        ("Misc", "multi_image.mbn"),
    ];
    MAP.iter()
        .find(|(elem, _)| *elem == element)
        .map(|(_, filename)| *filename)
}

fn has_firmware_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|ext| matches!(ext, "mbn" | "fls" | "elf" | "bin"))
        .unwrap_or(false)
}

fn install_blob(name: &str, data: &[u8], blob: &[u8]) -> Result<(Vec<u8>, bool), BasebandError> {
    if name.ends_with(".fls") {
        let mut fls = FlsFile::parse(data)?;
        fls.update_sig_blob(blob)?;
        Ok((fls.to_bytes(), true))
    } else {
        let mut mbn = MbnFile::parse(data)?;
        mbn.update_sig_blob(blob)?;
        Ok((mbn.into_bytes(), false))
    }
}

/// Sign and repack the baseband archive at `path` in place.
///
/// `ticket` is the baseband ticket response; `bb_nonce` is the
/// device-provided nonce when the device requested a personalized update.
pub fn sign_baseband_archive(
    path: &Path,
    ticket: &Dictionary,
    bb_nonce: Option<&[u8]>,
) -> Result<(), BasebandError> {
    let bbticket = ticket
        .get("BBTicket")
        .and_then(Value::as_data)
        .ok_or(BasebandError::MissingTicket)?;
    let bbfw = ticket
        .get("BasebandFirmware")
        .and_then(Value::as_dictionary)
        .ok_or(BasebandError::MissingFirmwareInfo)?;

    // Pull the whole archive into memory; the pass either fully succeeds or
    // leaves the file untouched.
    let mut entries: Vec<(String, Vec<u8>)> = Vec::new();
    {
        let mut archive = ZipArchive::new(File::open(path)?)?;
        for i in 0..archive.len() {
            let mut file = archive.by_index(i)?;
            if file.is_dir() {
                continue;
            }
            let mut buf = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut buf)?;
            entries.push((file.name().to_string(), buf));
        }
    }

    let mut signed: Vec<String> = Vec::new();
    let mut archive_is_fls = false;

    for (key, node) in bbfw {
        let Some(element) = key.strip_suffix("-Blob") else {
            continue;
        };
        let Some(blob) = node.as_data() else {
            continue;
        };
        let filename = filename_for_element(element)
            .ok_or_else(|| BasebandError::UnknownElement(element.to_string()))?;
        let entry = entries
            .iter_mut()
            .find(|(name, _)| name == filename)
            .ok_or_else(|| BasebandError::EntryMissing {
                element: element.to_string(),
                filename: filename.to_string(),
            })?;

        let (updated, is_fls) = install_blob(filename, &entry.1, blob)?;
        entry.1 = updated;
        archive_is_fls |= is_fls;
        debug!(element, filename, "Installed baseband signature blob");

        // Without a nonce, an FLS stack only needs its RamPSI retained.
        if is_fls && bb_nonce.is_none() {
            if element == "RamPSI" {
                signed.push(filename.to_string());
            }
        } else {
            signed.push(filename.to_string());
        }
    }

    entries.retain(|(name, _)| {
        signed.iter().any(|s| s == name)
            || (bb_nonce.is_some() && has_firmware_extension(name))
    });

    if bb_nonce.is_some() {
        if archive_is_fls {
            let entry = entries
                .iter_mut()
                .find(|(name, _)| name == "ebl.fls")
                .ok_or_else(|| BasebandError::EntryMissing {
                    element: "BBTicket".to_string(),
                    filename: "ebl.fls".to_string(),
                })?;
            let mut fls = FlsFile::parse(&entry.1)?;
            fls.insert_ticket(bbticket)?;
            entry.1 = fls.to_bytes();
            info!("Inserted BBTicket into ebl.fls");
        } else {
            entries.push(("bbticket.der".to_string(), bbticket.to_vec()));
            info!("Added bbticket.der to baseband archive");
        }
    }

    // Stage next to the original, then swap.
    let staged = path.with_extension("staged");
    let write_result = (|| -> Result<(), BasebandError> {
        let mut writer = ZipWriter::new(File::create(&staged)?);
        for (name, data) in &entries {
            writer.start_file(name.as_str(), SimpleFileOptions::default())?;
            writer.write_all(data)?;
        }
        writer.finish()?;
        Ok(())
    })();
    if let Err(e) = write_result {
        let _ = std::fs::remove_file(&staged);
        return Err(e);
    }
    std::fs::rename(&staged, path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fls::{FLS_ELEMENT_CODE, FLS_ELEMENT_SIGNATURE, FLS_ELEMENT_TICKET};
    use byteorder::{ByteOrder, LittleEndian};

    fn make_mbn(code: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; crate::mbn::MBN_HEADER_LEN];
        LittleEndian::write_u32(&mut buf[16..20], (code.len() + 4) as u32);
        LittleEndian::write_u32(&mut buf[20..24], code.len() as u32);
        LittleEndian::write_u32(&mut buf[28..32], 4);
        buf.extend_from_slice(code);
        buf.extend_from_slice(&[0u8; 4]);
        buf
    }

    fn make_fls() -> Vec<u8> {
        let mut element = |tag: u32, payload: &[u8]| {
            let mut out = vec![0u8; 8];
            LittleEndian::write_u32(&mut out[0..4], tag);
            LittleEndian::write_u32(&mut out[4..8], (8 + payload.len()) as u32);
            out.extend_from_slice(payload);
            out
        };
        let mut raw = element(FLS_ELEMENT_CODE, b"fls-code");
        raw.extend_from_slice(&element(FLS_ELEMENT_SIGNATURE, &[0u8; 8]));
        raw
    }

    fn write_archive(entries: &[(&str, &[u8])]) -> tempfile::NamedTempFile {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let mut writer = ZipWriter::new(tmp.reopen().unwrap());
        for (name, data) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        tmp
    }

    fn read_archive(path: &Path) -> Vec<(String, Vec<u8>)> {
        let mut archive = ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut out = Vec::new();
        for i in 0..archive.len() {
            let mut file = archive.by_index(i).unwrap();
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).unwrap();
            out.push((file.name().to_string(), buf));
        }
        out.sort();
        out
    }

    fn mbn_ticket() -> Dictionary {
        let mut bbfw = Dictionary::new();
        bbfw.insert("DBL-Blob".into(), Value::Data(vec![0xa5; 16]));
        bbfw.insert("ENANDPRG-Blob".into(), Value::Data(vec![0x5a; 16]));
        let mut ticket = Dictionary::new();
        ticket.insert("BBTicket".into(), Value::Data(vec![0xbb; 32]));
        ticket.insert("BasebandFirmware".into(), Value::Dictionary(bbfw));
        ticket
    }

    #[test]
    fn test_mbn_path_with_nonce() {
        let tmp = write_archive(&[
            ("dbl.mbn", &make_mbn(b"dbl-code")),
            ("ENPRG.mbn", &make_mbn(b"enprg-code")),
            ("README.txt", b"docs"),
        ]);

        sign_baseband_archive(tmp.path(), &mbn_ticket(), Some(&[0x01; 20])).unwrap();

        let entries = read_archive(tmp.path());
        let names: Vec<_> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["ENPRG.mbn", "bbticket.der", "dbl.mbn"]);

        // signature blobs were installed
        let dbl = entries.iter().find(|(n, _)| n == "dbl.mbn").unwrap();
        let mbn = MbnFile::parse(&dbl.1).unwrap();
        assert_eq!(&mbn.data()[mbn.data().len() - 16..], &[0xa5; 16][..]);

        // ticket is embedded verbatim
        let der = entries.iter().find(|(n, _)| n == "bbticket.der").unwrap();
        assert_eq!(der.1, vec![0xbb; 32]);
    }

    #[test]
    fn test_mbn_path_without_nonce_keeps_only_signed() {
        let tmp = write_archive(&[
            ("dbl.mbn", &make_mbn(b"dbl-code")),
            ("ENPRG.mbn", &make_mbn(b"enprg-code")),
            ("extra.mbn", &make_mbn(b"extra")),
            ("README.txt", b"docs"),
        ]);

        sign_baseband_archive(tmp.path(), &mbn_ticket(), None).unwrap();

        let entries = read_archive(tmp.path());
        let names: Vec<_> = entries.iter().map(|(n, _)| n.as_str()).collect();
        // no nonce: unsigned firmware files are pruned too, no bbticket.der
        assert_eq!(names, vec!["ENPRG.mbn", "dbl.mbn"]);
    }

    #[test]
    fn test_fls_path_inserts_ticket_into_ebl() {
        let mut bbfw = Dictionary::new();
        bbfw.insert("RamPSI-Blob".into(), Value::Data(vec![0x42; 8]));
        let mut ticket = Dictionary::new();
        ticket.insert("BBTicket".into(), Value::Data(vec![0xcc; 24]));
        ticket.insert("BasebandFirmware".into(), Value::Dictionary(bbfw));

        let tmp = write_archive(&[
            ("psi_ram.fls", &make_fls()),
            ("ebl.fls", &make_fls()),
            ("notes.txt", b"prune me"),
        ]);

        sign_baseband_archive(tmp.path(), &ticket, Some(&[0x02; 20])).unwrap();

        let entries = read_archive(tmp.path());
        let names: Vec<_> = entries.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["ebl.fls", "psi_ram.fls"]);

        let ebl = entries.iter().find(|(n, _)| n == "ebl.fls").unwrap();
        let fls = FlsFile::parse(&ebl.1).unwrap();
        assert_eq!(fls.element_payload(FLS_ELEMENT_TICKET), Some(&[0xcc; 24][..]));
    }

    #[test]
    fn test_unknown_element_fails() {
        let mut bbfw = Dictionary::new();
        bbfw.insert("Mystery-Blob".into(), Value::Data(vec![1, 2, 3]));
        let mut ticket = Dictionary::new();
        ticket.insert("BBTicket".into(), Value::Data(vec![0xbb; 4]));
        ticket.insert("BasebandFirmware".into(), Value::Dictionary(bbfw));

        let tmp = write_archive(&[("dbl.mbn", &make_mbn(b"code"))]);
        let err = sign_baseband_archive(tmp.path(), &ticket, None).unwrap_err();
        assert!(matches!(err, BasebandError::UnknownElement(e) if e == "Mystery"));
    }

    #[test]
    fn test_element_without_archive_entry_fails() {
        let tmp = write_archive(&[("dbl.mbn", &make_mbn(b"code"))]);
        // ticket names ENANDPRG but ENPRG.mbn is absent
        let err = sign_baseband_archive(tmp.path(), &mbn_ticket(), None).unwrap_err();
        assert!(matches!(err, BasebandError::EntryMissing { .. }));
    }

    #[test]
    fn test_missing_bbticket_fails() {
        let mut ticket = Dictionary::new();
        ticket.insert("BasebandFirmware".into(), Value::Dictionary(Dictionary::new()));
        let tmp = write_archive(&[("dbl.mbn", &make_mbn(b"code"))]);
        let err = sign_baseband_archive(tmp.path(), &ticket, None).unwrap_err();
        assert!(matches!(err, BasebandError::MissingTicket));
    }

    #[test]
    fn test_failed_pass_leaves_archive_untouched() {
        let original_entries = [
            ("dbl.mbn", &make_mbn(b"code")[..]),
            ("README.txt", &b"docs"[..]),
        ];
        let tmp = write_archive(&original_entries);
        let before = read_archive(tmp.path());

        let mut bbfw = Dictionary::new();
        bbfw.insert("Mystery-Blob".into(), Value::Data(vec![1]));
        let mut ticket = Dictionary::new();
        ticket.insert("BBTicket".into(), Value::Data(vec![0xbb]));
        ticket.insert("BasebandFirmware".into(), Value::Dictionary(bbfw));

        assert!(sign_baseband_archive(tmp.path(), &ticket, None).is_err());
        assert_eq!(read_archive(tmp.path()), before);
    }
}
