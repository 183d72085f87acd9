//! The manifest text format (spec §4.9) and its gzip/tar wrapping.
//!
//! Deliberately NOT `serde`+`bincode` (the teacher's `Index` on-disk
//! format): the manifest is the ASCII, NUL-separated text grammar the
//! original writes directly with `stringstream`s in `forward.cc`. Both
//! the forward engine (producing it) and the reverse engine (parsing it)
//! go through this module so the grammar is defined in exactly one place.
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::EngineError;
use crate::filesystem::{FileKind, FileStat};
use crate::tarentry::{build_volume_header, BLOCK_SIZE, TYPE_REGULAR};

pub const MANIFEST_VERSION: &str = env!("CARGO_PKG_VERSION");
const NUL: char = '\u{0}';

#[derive(Clone, Debug)]
pub struct ManifestHeader {
    pub version: String,
    pub message: String,
    pub uids: Vec<u32>,
    pub gids: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct ManifestFileEntry {
    pub permission_string: String,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub datetime: String,
    pub secs: i64,
    pub nanos: i64,
    /// Leading `/`, relative to the storage directory.
    pub path: String,
    /// Symlink target, or empty for everything else.
    pub link_info: String,
    /// Empty for directories.
    pub tar_file_name: String,
    /// Byte offset of this entry's *content* within `tar_file_name` — past
    /// its header blocks, not the entry's start (spec §4.9, §4.11 `read`).
    pub offset: u64,
    pub is_dir: bool,
}

#[derive(Clone, Debug)]
pub struct Manifest {
    pub header: ManifestHeader,
    pub files: Vec<ManifestFileEntry>,
    /// Tar paths relative to the storage directory.
    pub tars: Vec<String>,
}

/// `ls -l`-style 10-character permission string, including setuid/setgid/
/// sticky bits folded into the execute-bit position.
pub fn permission_string(kind: FileKind, perm: u32) -> String {
    let type_char = match kind {
        FileKind::Directory => 'd',
        FileKind::Symlink => 'l',
        FileKind::Fifo => 'p',
        FileKind::CharDevice => 'c',
        FileKind::BlockDevice => 'b',
        FileKind::Socket => 's',
        FileKind::Regular => '-',
    };
    let setuid = perm & 0o4000 != 0;
    let setgid = perm & 0o2000 != 0;
    let sticky = perm & 0o1000 != 0;

    let bit = |mask: u32| if perm & mask != 0 { true } else { false };
    let rwx = |r: u32, w: u32, x: u32, special: bool, special_char_lower: char, special_char_upper: char| {
        let mut s = String::new();
        s.push(if bit(r) { 'r' } else { '-' });
        s.push(if bit(w) { 'w' } else { '-' });
        s.push(if special {
            if bit(x) { special_char_lower } else { special_char_upper }
        } else if bit(x) {
            'x'
        } else {
            '-'
        });
        s
    };

    let mut out = String::new();
    out.push(type_char);
    out.push_str(&rwx(0o400, 0o200, 0o100, setuid, 's', 'S'));
    out.push_str(&rwx(0o040, 0o020, 0o010, setgid, 's', 'S'));
    out.push_str(&rwx(0o004, 0o002, 0o001, sticky, 't', 'T'));
    out
}

/// Inverse of [`permission_string`]: recovers the file kind and the 12
/// permission bits (including setuid/setgid/sticky) from an `ls -l`-style
/// string, for the reverse engine (spec §4.11).
pub fn parse_permission_string(s: &str) -> Result<(FileKind, u32), EngineError> {
    let bytes = s.as_bytes();
    if bytes.len() != 10 {
        return Err(EngineError::ManifestCorrupt(s.to_string(), "permission string must be 10 chars".to_string()));
    }
    let kind = match bytes[0] {
        b'd' => FileKind::Directory,
        b'l' => FileKind::Symlink,
        b'p' => FileKind::Fifo,
        b'c' => FileKind::CharDevice,
        b'b' => FileKind::BlockDevice,
        b's' => FileKind::Socket,
        b'-' => FileKind::Regular,
        _ => return Err(EngineError::ManifestCorrupt(s.to_string(), "unknown type character".to_string())),
    };
    let mut perm: u32 = 0;
    let bit_set = |c: u8, set: u8| c == set;
    if bit_set(bytes[1], b'r') {
        perm |= 0o400;
    }
    if bit_set(bytes[2], b'w') {
        perm |= 0o200;
    }
    match bytes[3] {
        b'x' => perm |= 0o100,
        b's' => perm |= 0o100 | 0o4000,
        b'S' => perm |= 0o4000,
        b'-' => {}
        _ => return Err(EngineError::ManifestCorrupt(s.to_string(), "bad owner-exec char".to_string())),
    }
    if bit_set(bytes[4], b'r') {
        perm |= 0o040;
    }
    if bit_set(bytes[5], b'w') {
        perm |= 0o020;
    }
    match bytes[6] {
        b'x' => perm |= 0o010,
        b's' => perm |= 0o010 | 0o2000,
        b'S' => perm |= 0o2000,
        b'-' => {}
        _ => return Err(EngineError::ManifestCorrupt(s.to_string(), "bad group-exec char".to_string())),
    }
    if bit_set(bytes[7], b'r') {
        perm |= 0o004;
    }
    if bit_set(bytes[8], b'w') {
        perm |= 0o002;
    }
    match bytes[9] {
        b'x' => perm |= 0o001,
        b't' => perm |= 0o001 | 0o1000,
        b'T' => perm |= 0o1000,
        b'-' => {}
        _ => return Err(EngineError::ManifestCorrupt(s.to_string(), "bad other-exec char".to_string())),
    }
    Ok((kind, perm))
}

fn format_datetime(secs: i64) -> String {
    // YYYY-MM-DD HH:MM.SS, UTC (no chrono in the teacher's stack; a small
    // civil-from-days conversion is all that's needed, per Howard
    // Hinnant's well-known algorithm).
    let days = secs.div_euclid(86_400);
    let rem = secs.rem_euclid(86_400);
    let hour = rem / 3600;
    let minute = (rem % 3600) / 60;
    let second = rem % 60;

    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as i64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { y + 1 } else { y };

    format!("{:04}-{:02}-{:02} {:02}:{:02}.{:02}", year, month, day, hour, minute, second)
}

impl ManifestFileEntry {
    pub fn from_stat(path: &str, stat: &FileStat, tar_file_name: &str, offset: u64) -> ManifestFileEntry {
        let is_dir = stat.is_dir();
        let size = if stat.kind == FileKind::Symlink { 0 } else { stat.size };
        ManifestFileEntry {
            permission_string: permission_string(stat.kind, stat.perm),
            uid: stat.uid,
            gid: stat.gid,
            size,
            datetime: format_datetime(stat.mtime.sec),
            secs: stat.mtime.sec,
            nanos: stat.mtime.nsec,
            path: path.to_string(),
            link_info: stat.link_target.clone().unwrap_or_default(),
            tar_file_name: if is_dir { String::new() } else { tar_file_name.to_string() },
            offset: if is_dir { 0 } else { offset },
            is_dir,
        }
    }

    fn encode(&self) -> String {
        format!(
            "{p}{n}{ug}{n}{size}{n}{dt}{n}{secs}.{nanos}{n}{path}{n}{link}{n}{tar}{n}{off}",
            p = self.permission_string,
            ug = format!("{}/{}", self.uid, self.gid),
            size = self.size,
            dt = self.datetime,
            secs = self.secs,
            nanos = self.nanos,
            path = self.path,
            link = self.link_info,
            tar = self.tar_file_name,
            off = self.offset,
            n = NUL,
        )
    }

    fn decode(line: &str) -> Result<ManifestFileEntry, EngineError> {
        let cols: Vec<&str> = line.split(NUL).collect();
        if cols.len() != 9 {
            return Err(EngineError::ManifestCorrupt(
                "<file line>".to_string(),
                format!("expected 9 columns, got {}", cols.len()),
            ));
        }
        let ug = cols[1];
        let (uid, gid) = ug
            .split_once('/')
            .ok_or_else(|| EngineError::ManifestCorrupt(line.to_string(), "malformed uid/gid".to_string()))?;
        let uid: u32 = uid
            .parse()
            .map_err(|_| EngineError::ManifestCorrupt(line.to_string(), "malformed uid".to_string()))?;
        let gid: u32 = gid
            .parse()
            .map_err(|_| EngineError::ManifestCorrupt(line.to_string(), "malformed gid".to_string()))?;
        let size: u64 = cols[2]
            .parse()
            .map_err(|_| EngineError::ManifestCorrupt(line.to_string(), "malformed size".to_string()))?;
        let (secs, nanos) = cols[4]
            .split_once('.')
            .ok_or_else(|| EngineError::ManifestCorrupt(line.to_string(), "malformed secs.nanos".to_string()))?;
        let secs: i64 = secs
            .parse()
            .map_err(|_| EngineError::ManifestCorrupt(line.to_string(), "malformed secs".to_string()))?;
        let nanos: i64 = nanos
            .parse()
            .map_err(|_| EngineError::ManifestCorrupt(line.to_string(), "malformed nanos".to_string()))?;
        let offset: u64 = if cols[8].is_empty() {
            0
        } else {
            cols[8]
                .parse()
                .map_err(|_| EngineError::ManifestCorrupt(line.to_string(), "malformed offset".to_string()))?
        };
        let is_dir = cols[0].starts_with('d');
        Ok(ManifestFileEntry {
            permission_string: cols[0].to_string(),
            uid,
            gid,
            size,
            datetime: cols[3].to_string(),
            secs,
            nanos,
            path: cols[5].to_string(),
            link_info: cols[6].to_string(),
            tar_file_name: cols[7].to_string(),
            offset,
            is_dir,
        })
    }
}

/// Encodes the full NUL-separated manifest text (spec §4.9).
pub fn encode_text(manifest: &Manifest) -> String {
    let mut out = String::new();
    out.push_str(&format!("#beak {}\n", manifest.header.version));
    out.push_str(&format!("#message {}\n", manifest.header.message));
    out.push_str(&format!(
        "#uids {}\n",
        manifest.header.uids.iter().map(|u| u.to_string()).collect::<Vec<_>>().join(" ")
    ));
    out.push_str(&format!(
        "#gids {}\n",
        manifest.header.gids.iter().map(|g| g.to_string()).collect::<Vec<_>>().join(" ")
    ));
    out.push_str(&format!("#files {}\n", manifest.files.len()));
    for f in &manifest.files {
        out.push(NUL);
        out.push_str(&f.encode());
        out.push('\n');
    }
    out.push_str(&format!("#tars {}\n", manifest.tars.len()));
    for t in &manifest.tars {
        out.push(NUL);
        out.push_str(t);
        out.push('\n');
    }
    out
}

/// Parses the manifest text grammar (spec §4.9). Returns `ManifestCorrupt`
/// on any structural mismatch; never panics on attacker-controlled input.
pub fn decode_text(text: &str) -> Result<Manifest, EngineError> {
    let mut lines = text.lines();
    let first = lines.next().unwrap_or("");
    if !first.starts_with("#beak ") {
        return Err(EngineError::ManifestCorrupt(
            "<header>".to_string(),
            format!("expected '#beak <version>', got {:?}", first),
        ));
    }
    let version = first["#beak ".len()..].to_string();

    let message_line = lines
        .next()
        .ok_or_else(|| EngineError::ManifestCorrupt("<header>".to_string(), "missing #message line".to_string()))?;
    let message = message_line.strip_prefix("#message ").unwrap_or("").to_string();

    let uids_line = lines
        .next()
        .ok_or_else(|| EngineError::ManifestCorrupt("<header>".to_string(), "missing #uids line".to_string()))?;
    let uids = parse_id_list(uids_line, "#uids ")?;

    let gids_line = lines
        .next()
        .ok_or_else(|| EngineError::ManifestCorrupt("<header>".to_string(), "missing #gids line".to_string()))?;
    let gids = parse_id_list(gids_line, "#gids ")?;

    let files_line = lines
        .next()
        .ok_or_else(|| EngineError::ManifestCorrupt("<header>".to_string(), "missing #files line".to_string()))?;
    let num_files: usize = files_line
        .strip_prefix("#files ")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| EngineError::ManifestCorrupt(files_line.to_string(), "malformed #files count".to_string()))?;

    let mut files = Vec::with_capacity(num_files);
    for _ in 0..num_files {
        let line = lines
            .next()
            .ok_or_else(|| EngineError::ManifestCorrupt("<files>".to_string(), "truncated file list".to_string()))?;
        let line = line.strip_prefix(NUL).unwrap_or(line);
        files.push(ManifestFileEntry::decode(line)?);
    }

    let tars_line = lines
        .next()
        .ok_or_else(|| EngineError::ManifestCorrupt("<header>".to_string(), "missing #tars line".to_string()))?;
    let num_tars: usize = tars_line
        .strip_prefix("#tars ")
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| EngineError::ManifestCorrupt(tars_line.to_string(), "malformed #tars count".to_string()))?;

    let mut tars = Vec::with_capacity(num_tars);
    for _ in 0..num_tars {
        let line = lines
            .next()
            .ok_or_else(|| EngineError::ManifestCorrupt("<tars>".to_string(), "truncated tar list".to_string()))?;
        let line = line.strip_prefix(NUL).unwrap_or(line);
        tars.push(line.to_string());
    }

    Ok(Manifest { header: ManifestHeader { version, message, uids, gids }, files, tars })
}

fn parse_id_list(line: &str, prefix: &str) -> Result<Vec<u32>, EngineError> {
    let rest = line
        .strip_prefix(prefix)
        .ok_or_else(|| EngineError::ManifestCorrupt(line.to_string(), format!("expected {prefix:?}")))?;
    if rest.is_empty() {
        return Ok(Vec::new());
    }
    rest.split(' ')
        .map(|s| s.parse().map_err(|_| EngineError::ManifestCorrupt(line.to_string(), "malformed id".to_string())))
        .collect()
}

pub fn gzip_bytes(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).expect("writing to an in-memory Vec never fails");
    enc.finish().expect("in-memory gzip finish never fails")
}

pub fn gunzip_bytes(data: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut dec = GzDecoder::new(data);
    let mut out = Vec::new();
    dec.read_to_end(&mut out)
        .map_err(|e| EngineError::UnderlyingIo("<gzip blob>".to_string(), e))?;
    Ok(out)
}

/// Builds the `beak`/`beak-contents` wrapper tar around the gzipped
/// manifest text (spec §4.9/§6): a volume-header entry named `beak`
/// followed by a regular-file entry named `beak-contents`.
pub fn build_manifest_tar_bytes(manifest: &Manifest) -> Vec<u8> {
    let text = encode_text(manifest);
    let gz = gzip_bytes(text.as_bytes());

    let mut out = build_volume_header("beak");

    let mut header = [0u8; 512];
    write_contents_header(&mut header, gz.len() as u64);
    out.extend_from_slice(&header);
    out.extend_from_slice(&gz);
    let padded = round_up(gz.len() as u64);
    out.resize(out.len() - gz.len() + padded as usize, 0);
    out
}

fn write_contents_header(header: &mut [u8; 512], size: u64) {
    // Mirrors tarentry::build_header_block's field layout for a bare
    // regular-file header named `beak-contents`.
    let name = b"beak-contents";
    header[..name.len()].copy_from_slice(name);
    let mode = format!("{:07o}", 0o644u32);
    header[100..107].copy_from_slice(mode.as_bytes());
    header[107] = 0;
    let size_str = format!("{:011o}", size);
    header[124..135].copy_from_slice(size_str.as_bytes());
    header[135] = 0;
    header[148..156].copy_from_slice(b"        ");
    header[156] = TYPE_REGULAR;
    header[257..263].copy_from_slice(b"ustar\0");
    header[263..265].copy_from_slice(b"00");
    let checksum: u32 = header.iter().map(|b| *b as u32).sum();
    let cs = format!("{:06o}", checksum);
    header[148..154].copy_from_slice(cs.as_bytes());
    header[154] = 0;
    header[155] = b' ';
}

fn round_up(n: u64) -> u64 {
    (n + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE
}

/// Parses a manifest archive's raw tar bytes (spec §4.11 `loadGz`):
/// verifies entry[0] is the `beak` volume header and entry[1] is
/// `beak-contents`, then gunzips and decodes its payload.
pub fn parse_manifest_tar_bytes(bytes: &[u8], describe: &str) -> Result<Manifest, EngineError> {
    if bytes.len() < 1024 {
        return Err(EngineError::ManifestCorrupt(describe.to_string(), "truncated archive".to_string()));
    }
    let vol_name = read_cstr(&bytes[0..100]);
    if vol_name != "beak" || bytes[156] != crate::tarentry::TYPE_VOLUME_HEADER {
        return Err(EngineError::ManifestCorrupt(
            describe.to_string(),
            "missing 'beak' volume header entry".to_string(),
        ));
    }
    let second = &bytes[512..1024];
    let contents_name = read_cstr(&second[0..100]);
    if contents_name != "beak-contents" {
        return Err(EngineError::ManifestCorrupt(
            describe.to_string(),
            "missing 'beak-contents' entry".to_string(),
        ));
    }
    let size = parse_octal(&second[124..136]);
    let start = 1024usize;
    let end = start + size as usize;
    if end > bytes.len() {
        return Err(EngineError::ManifestCorrupt(describe.to_string(), "truncated beak-contents payload".to_string()));
    }
    let gz = &bytes[start..end];
    let text = gunzip_bytes(gz)?;
    let text = String::from_utf8(text)
        .map_err(|_| EngineError::ManifestCorrupt(describe.to_string(), "manifest text is not UTF-8".to_string()))?;
    decode_text(&text)
}

fn read_cstr(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn parse_octal(field: &[u8]) -> u64 {
    let end = field.iter().position(|b| *b == 0 || *b == b' ').unwrap_or(field.len());
    u64::from_str_radix(std::str::from_utf8(&field[..end]).unwrap_or("0"), 8).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::Timespec;

    fn sample_manifest() -> Manifest {
        Manifest {
            header: ManifestHeader {
                version: MANIFEST_VERSION.to_string(),
                message: "backup".to_string(),
                uids: vec![1000],
                gids: vec![1000],
            },
            files: vec![
                ManifestFileEntry {
                    permission_string: "drwxr-xr-x".to_string(),
                    uid: 1000,
                    gid: 1000,
                    size: 0,
                    datetime: "2026-07-28 00:00.00".to_string(),
                    secs: 1_700_000_000,
                    nanos: 0,
                    path: "/".to_string(),
                    link_info: String::new(),
                    tar_file_name: String::new(),
                    offset: 0,
                    is_dir: true,
                },
                ManifestFileEntry {
                    permission_string: "-rw-r--r--".to_string(),
                    uid: 1000,
                    gid: 1000,
                    size: 5,
                    datetime: "2026-07-28 00:00.00".to_string(),
                    secs: 1_700_000_000,
                    nanos: 123,
                    path: "/x".to_string(),
                    link_info: String::new(),
                    tar_file_name: "tar00000000_abc_5.tar".to_string(),
                    offset: 0,
                    is_dir: false,
                },
            ],
            tars: vec!["tar00000000_abc_5.tar".to_string()],
        }
    }

    #[test]
    fn round_trips_through_text() {
        let m = sample_manifest();
        let text = encode_text(&m);
        let decoded = decode_text(&text).unwrap();
        assert_eq!(decoded.header.version, m.header.version);
        assert_eq!(decoded.files.len(), 2);
        assert_eq!(decoded.files[1].path, "/x");
        assert_eq!(decoded.files[1].offset, 0);
        assert_eq!(decoded.tars, m.tars);
    }

    #[test]
    fn rejects_wrong_header_as_manifest_corrupt() {
        let err = decode_text("#tarredfs 0.1\n").unwrap_err();
        assert!(matches!(err, EngineError::ManifestCorrupt(_, _)));
    }

    #[test]
    fn round_trips_through_gzip_tar_wrapper() {
        let m = sample_manifest();
        let bytes = build_manifest_tar_bytes(&m);
        let decoded = parse_manifest_tar_bytes(&bytes, "test").unwrap();
        assert_eq!(decoded.files.len(), m.files.len());
    }

    #[test]
    fn permission_string_round_trips_through_parse() {
        for (kind, perm) in [
            (FileKind::Regular, 0o644),
            (FileKind::Directory, 0o755),
            (FileKind::Symlink, 0o777),
            (FileKind::Regular, 0o4755),
            (FileKind::Directory, 0o2775),
            (FileKind::Regular, 0o1777),
        ] {
            let s = permission_string(kind, perm);
            let (k, p) = parse_permission_string(&s).unwrap();
            assert_eq!(k, kind);
            assert_eq!(p, perm & 0o7777);
        }
    }

    #[test]
    fn stat_to_file_entry_directories_have_no_tar_or_offset() {
        let stat = FileStat {
            kind: FileKind::Directory,
            perm: 0o755,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 4096,
            atime: Timespec::default(),
            mtime: Timespec { sec: 0, nsec: 0 },
            ctime: Timespec::default(),
            nlink: 2,
            ino: 1,
            dev: 1,
            link_target: None,
        };
        let entry = ManifestFileEntry::from_stat("/a", &stat, "irrelevant", 123);
        assert_eq!(entry.size, 0);
        assert_eq!(entry.tar_file_name, "");
        assert_eq!(entry.offset, 0);
    }
}
