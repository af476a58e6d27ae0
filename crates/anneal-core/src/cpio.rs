//! ODC cpio record encoding
//!
//! The bootability bundle is streamed to the device as a sequence of cpio
//! records in the portable ASCII (odc, magic `070707`) format: a 76-byte
//! header of fixed-width octal fields, the NUL-terminated file name, then
//! the file data. The stream ends with the canonical `TRAILER!!!` record.

/// Magic leading every odc record.
pub const ODC_MAGIC: &[u8; 6] = b"070707";

/// Name of the terminating record.
pub const TRAILER_NAME: &str = "TRAILER!!!";

const HEADER_LEN: usize = 76;

/// Header fields for one record. uid/gid are not representable: the stream
/// always carries them as zero.
#[derive(Debug, Clone, Default)]
pub struct RecordMeta {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub rdev: u64,
    pub mtime: u64,
}

fn octal(out: &mut Vec<u8>, width: usize, value: u64) {
    let s = format!("{value:0width$o}");
    // A value wider than its field is truncated to the low digits, the way
    // fixed-width octal headers overflow.
    let bytes = s.as_bytes();
    out.extend_from_slice(&bytes[bytes.len() - width..]);
}

/// Encode a full record: header, NUL-terminated name, and data when present.
///
/// The filesize field is written only for records that carry data; uid and
/// gid are forced to zero.
pub fn encode_record(name: &str, meta: &RecordMeta, data: Option<&[u8]>) -> Vec<u8> {
    let name_len = name.len() + 1;
    let data_len = data.map(<[u8]>::len).unwrap_or(0);
    let mut out = Vec::with_capacity(HEADER_LEN + name_len + data_len);

    out.extend_from_slice(ODC_MAGIC);
    octal(&mut out, 6, meta.dev);
    octal(&mut out, 6, meta.ino);
    octal(&mut out, 6, meta.mode as u64);
    octal(&mut out, 6, 0); // uid
    octal(&mut out, 6, 0); // gid
    octal(&mut out, 6, meta.nlink);
    octal(&mut out, 6, meta.rdev);
    octal(&mut out, 11, meta.mtime);
    octal(&mut out, 6, name_len as u64);
    octal(&mut out, 11, data_len as u64);

    out.extend_from_slice(name.as_bytes());
    out.push(0);
    if let Some(data) = data {
        out.extend_from_slice(data);
    }
    out
}

/// The canonical trailer record: every field zero except nlink.
pub fn trailer_record() -> Vec<u8> {
    let meta = RecordMeta {
        nlink: 1,
        ..RecordMeta::default()
    };
    encode_record(TRAILER_NAME, &meta, None)
}
