//! `TarEntry`: one source-tree object lifted into a tar record (spec §3,
//! §4.3, §4.10.1). Builds GNU-tar-compatible header bytes (with long-name
//! `L` / long-link `K` extensions) and serves its byte range on demand,
//! grounded in the teacher's `tar.rs::PosixHeader` layout — but this side
//! *writes* headers, since the teacher only ever parsed them.
use std::io;
use std::path::PathBuf;

use crate::filesystem::{FileKind, FileStat, FileSystem};
use crate::hash::tarpath_hash;
use crate::path::Path;

pub const BLOCK_SIZE: u64 = 512;
const NAME_FIELD_LEN: usize = 100;
const LINK_FIELD_LEN: usize = 100;

pub const TYPE_REGULAR: u8 = b'0';
pub const TYPE_HARDLINK: u8 = b'1';
pub const TYPE_SYMLINK: u8 = b'2';
pub const TYPE_CHARDEV: u8 = b'3';
pub const TYPE_BLOCKDEV: u8 = b'4';
pub const TYPE_DIRECTORY: u8 = b'5';
pub const TYPE_FIFO: u8 = b'6';
pub const TYPE_GNU_LONGLINK: u8 = b'K';
pub const TYPE_GNU_LONGNAME: u8 = b'L';
pub const TYPE_VOLUME_HEADER: u8 = b'V';

fn typeflag_for(kind: FileKind) -> u8 {
    match kind {
        FileKind::Regular => TYPE_REGULAR,
        FileKind::Directory => TYPE_DIRECTORY,
        FileKind::Symlink => TYPE_SYMLINK,
        FileKind::Fifo => TYPE_FIFO,
        FileKind::CharDevice => TYPE_CHARDEV,
        FileKind::BlockDevice => TYPE_BLOCKDEV,
        FileKind::Socket => TYPE_REGULAR, // sockets are skipped before reaching here
    }
}

/// Writes `value` as zero-padded octal ASCII into `field`, NUL-terminated.
fn put_octal(field: &mut [u8], value: u64) {
    let digits = field.len() - 1;
    let s = format!("{:0width$o}", value, width = digits);
    let bytes = s.as_bytes();
    let start = bytes.len().saturating_sub(digits);
    field[..digits].copy_from_slice(&bytes[start..]);
    field[digits] = 0;
}

fn put_str(field: &mut [u8], s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(field.len());
    field[..n].copy_from_slice(&bytes[..n]);
    for b in field.iter_mut().skip(n) {
        *b = 0;
    }
}

/// Builds one raw 512-byte ustar/GNU header block.
#[allow(clippy::too_many_arguments)]
fn build_header_block(
    name: &str,
    mode: u32,
    uid: u32,
    gid: u32,
    size: u64,
    mtime: i64,
    typeflag: u8,
    linkname: &str,
) -> [u8; 512] {
    let mut h = [0u8; 512];
    // name: 0..100
    put_str(&mut h[0..100], &name[..name.len().min(NAME_FIELD_LEN)]);
    put_octal(&mut h[100..108], mode as u64);
    put_octal(&mut h[108..116], uid as u64);
    put_octal(&mut h[116..124], gid as u64);
    put_octal(&mut h[124..136], size);
    put_octal(&mut h[136..148], mtime.max(0) as u64);
    // chksum (148..156) filled as spaces for the checksum pass.
    h[148..156].copy_from_slice(b"        ");
    h[156] = typeflag;
    put_str(&mut h[157..257], &linkname[..linkname.len().min(LINK_FIELD_LEN)]);
    put_str(&mut h[257..263], "ustar");
    h[263..265].copy_from_slice(b"00");
    put_str(&mut h[265..297], "");
    put_str(&mut h[297..329], "");
    put_octal(&mut h[329..337], 0);
    put_octal(&mut h[337..345], 0);
    // prefix 345..500, padding 500..512 left as zero.

    let checksum: u32 = h.iter().map(|b| *b as u32).sum();
    let cs = format!("{:06o}", checksum);
    h[148..154].copy_from_slice(cs.as_bytes());
    h[154] = 0;
    h[155] = b' ';
    h
}

fn gnu_long_block(typeflag: u8, payload: &str) -> Vec<u8> {
    let header = build_header_block(
        "././@LongLink",
        0,
        0,
        0,
        payload.len() as u64 + 1,
        0,
        typeflag,
        "",
    );
    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(&header);
    let mut body = payload.as_bytes().to_vec();
    body.push(0);
    let padded = round_up_block(body.len() as u64) as usize;
    body.resize(padded, 0);
    out.extend_from_slice(&body);
    out
}

fn round_up_block(n: u64) -> u64 {
    (n + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE
}

fn blocks_for_long_field(len: usize) -> u64 {
    // 1 header block + ceil((len+1)/512) payload blocks (NUL terminator
    // included), matching the original's `num_long_*_blocks` accounting.
    1 + round_up_block(len as u64 + 1) / BLOCK_SIZE
}

/// Whether a non-directory entry stores content or is header-only.
#[derive(Clone, Debug)]
pub enum HardLinkState {
    /// Ordinary entry, or the first-seen entry for its inode.
    NotLinked,
    /// Content is stored in this entry's tar; it is the hard-link target.
    Original,
    /// Header-only type-1 record pointing at `target_tarpath`.
    Link { target_tarpath: String },
}

/// Where an entry's content bytes come from, for the serve phase.
#[derive(Clone, Debug)]
pub enum Content {
    /// Read through the filesystem abstraction at `abspath`.
    RealFile(PathBuf),
    /// Content is already materialized (used for the manifest's
    /// `beak-contents` blob).
    InMemory(Vec<u8>),
    /// No content (directories, symlinks, fifos, devices, hard links).
    None,
}

/// One source-tree object lifted into a tar record (spec §3).
#[derive(Clone, Debug)]
pub struct TarEntry {
    pub abspath: PathBuf,
    pub path: Path,
    pub tarpath: String,
    pub stat: FileStat,

    pub header_bytes: Vec<u8>,
    pub header_blocks: u64,
    pub header_size: u64,
    pub size: u64,
    pub blocked_size: u64,
    pub tarpath_hash: u64,

    pub hardlink: HardLinkState,
    pub content: Content,

    pub parent: Option<Path>,
    pub children_size: u64,

    pub is_storage_dir: bool,
    pub added_to_dir: bool,
}

impl TarEntry {
    /// Build a fresh entry from a scanned `(abspath, path, stat)` triple.
    /// `tarpath` is initially `path` with its leading `/` stripped; prefix
    /// stripping down to the storage directory happens later via
    /// `remove_prefix`.
    pub fn new(abspath: PathBuf, path: Path, stat: FileStat, content: Content) -> TarEntry {
        let tarpath = path.str().trim_start_matches('/').to_string();
        let mut entry = TarEntry {
            abspath,
            path,
            tarpath,
            stat,
            header_bytes: Vec::new(),
            header_blocks: 0,
            header_size: 0,
            size: 0,
            blocked_size: 0,
            tarpath_hash: 0,
            hardlink: HardLinkState::NotLinked,
            content,
            parent: None,
            children_size: 0,
            is_storage_dir: false,
            added_to_dir: false,
        };
        entry.rebuild_header();
        entry
    }

    fn effective_typeflag(&self) -> u8 {
        match &self.hardlink {
            HardLinkState::Link { .. } => TYPE_HARDLINK,
            _ => typeflag_for(self.stat.kind),
        }
    }

    fn effective_linkname(&self) -> String {
        match &self.hardlink {
            HardLinkState::Link { target_tarpath } => target_tarpath.clone(),
            _ => self.stat.link_target.clone().unwrap_or_default(),
        }
    }

    fn has_content(&self) -> bool {
        matches!(self.stat.kind, FileKind::Regular) && !matches!(self.hardlink, HardLinkState::Link { .. })
    }

    /// Recomputes `header_bytes`, block counts, and `tarpath_hash` from the
    /// current `tarpath`/`hardlink` state. Called on construction, after
    /// `remove_prefix`, and after hard-link rewriting.
    pub fn rebuild_header(&mut self) {
        let typeflag = self.effective_typeflag();
        let linkname = self.effective_linkname();

        let mut long_blocks: u64 = 1; // primary header
        let mut prefix = Vec::new();

        let need_long_link = linkname.len() > LINK_FIELD_LEN;
        let need_long_name = self.tarpath.len() > NAME_FIELD_LEN;

        if need_long_link {
            prefix.extend(gnu_long_block(TYPE_GNU_LONGLINK, &linkname));
            long_blocks += blocks_for_long_field(linkname.len());
        }
        if need_long_name {
            prefix.extend(gnu_long_block(TYPE_GNU_LONGNAME, &self.tarpath));
            long_blocks += blocks_for_long_field(self.tarpath.len());
        }

        let content_size = if self.has_content() { self.stat.size } else { 0 };
        let primary = build_header_block(
            &self.tarpath,
            self.stat.perm,
            self.stat.uid,
            self.stat.gid,
            content_size,
            self.stat.mtime.sec,
            typeflag,
            &linkname,
        );

        let mut bytes = prefix;
        bytes.extend_from_slice(&primary);

        self.header_blocks = long_blocks;
        self.header_size = long_blocks * BLOCK_SIZE;
        self.header_bytes = bytes;
        self.size = self.header_size + content_size;
        self.blocked_size = round_up_block(self.size);
        self.tarpath_hash = tarpath_hash(&self.tarpath);
    }

    /// Strips the first `len` bytes of `tarpath` (storage-directory prefix
    /// removal) and rebuilds the header accordingly (spec §4.3).
    pub fn remove_prefix(&mut self, len: usize) {
        self.tarpath = self.tarpath[len.min(self.tarpath.len())..].to_string();
        self.rebuild_header();
    }

    /// Rewrites this entry into a header-only hard-link record pointing at
    /// `target_tarpath` (spec §4.6).
    pub fn make_hardlink(&mut self, target_tarpath: String) {
        self.hardlink = HardLinkState::Link { target_tarpath };
        self.content = Content::None;
        self.rebuild_header();
    }

    /// Emits `buf.len()` bytes (or fewer, if the entry runs out) starting
    /// at `from` within this entry's own `[0, blocked_size)` range (spec
    /// §4.10.1).
    pub fn copy(&self, fs: &dyn FileSystem, buf: &mut [u8], from: u64) -> io::Result<usize> {
        if from >= self.blocked_size {
            return Ok(0);
        }
        let want = buf.len() as u64;
        let avail = self.blocked_size - from;
        let to_copy = want.min(avail) as usize;
        let mut copied = 0usize;

        if from < self.header_size {
            let start = from as usize;
            let len = ((self.header_size - from) as usize).min(to_copy);
            buf[..len].copy_from_slice(&self.header_bytes[start..start + len]);
            copied += len;
        }

        if copied < to_copy {
            let content_from = from + copied as u64 - self.header_size;
            let remaining = to_copy - copied;
            match &self.content {
                Content::None => {
                    for b in &mut buf[copied..to_copy] {
                        *b = 0;
                    }
                    copied = to_copy;
                }
                Content::InMemory(data) => {
                    let off = content_from as usize;
                    let n = remaining.min(data.len().saturating_sub(off));
                    buf[copied..copied + n].copy_from_slice(&data[off..off + n]);
                    copied += n;
                }
                Content::RealFile(path) => {
                    let content_size = self.size - self.header_size;
                    let n = (remaining as u64).min(content_size.saturating_sub(content_from)) as usize;
                    if n > 0 {
                        let got = fs.pread(path, &mut buf[copied..copied + n], content_from)?;
                        copied += got;
                    }
                }
            }
        }

        for b in &mut buf[copied..to_copy] {
            *b = 0;
        }
        Ok(to_copy)
    }
}

/// Builds a standalone type-`V` volume-header block (used as the
/// manifest archive's first entry, spec §4.9/§6).
pub fn build_volume_header(name: &str) -> Vec<u8> {
    build_header_block(name, 0, 0, 0, 0, 0, TYPE_VOLUME_HEADER, "").to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::Timespec;

    fn stat(kind: FileKind, size: u64) -> FileStat {
        FileStat {
            kind,
            perm: 0o644,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            size,
            atime: Timespec::default(),
            mtime: Timespec { sec: 1_700_000_000, nsec: 0 },
            ctime: Timespec::default(),
            nlink: 1,
            ino: 42,
            dev: 1,
            link_target: None,
        }
    }

    #[test]
    fn short_name_needs_no_long_name_header() {
        let p = Path::lookup("/hello");
        let e = TarEntry::new(PathBuf::from("/src/hello"), p, stat(FileKind::Regular, 5), Content::None);
        assert_eq!(e.header_blocks, 1);
        assert_eq!(e.header_size, 512);
    }

    #[test]
    fn name_of_exactly_100_bytes_needs_no_long_name_header() {
        let name = "a".repeat(100);
        let p = Path::root().child(&name);
        let e = TarEntry::new(PathBuf::from("/src"), p, stat(FileKind::Regular, 1), Content::None);
        assert_eq!(e.tarpath.len(), 100);
        assert_eq!(e.header_blocks, 1);
    }

    #[test]
    fn name_of_101_bytes_needs_one_long_name_block_and_one_payload_block() {
        let name = "a".repeat(101);
        let p = Path::root().child(&name);
        let e = TarEntry::new(PathBuf::from("/src"), p, stat(FileKind::Regular, 1), Content::None);
        // 1 (long-name header) + 1 (payload) + 1 (primary header) = 3
        assert_eq!(e.header_blocks, 3);
        assert_eq!(e.header_size, 3 * 512);
    }

    #[test]
    fn name_of_613_bytes_needs_two_payload_blocks() {
        let name = "a".repeat(613);
        let p = Path::root().child(&name);
        let e = TarEntry::new(PathBuf::from("/src"), p, stat(FileKind::Regular, 1), Content::None);
        // 1 (long-name header) + 2 (payload) + 1 (primary header) = 4
        assert_eq!(e.header_blocks, 4);
    }

    #[test]
    fn directory_and_symlink_have_no_content_bytes() {
        let p = Path::lookup("/dir");
        let e = TarEntry::new(PathBuf::from("/src/dir"), p, stat(FileKind::Directory, 4096), Content::None);
        assert_eq!(e.size, e.header_size);
        assert_eq!(e.blocked_size, e.header_size);
    }

    #[test]
    fn hardlink_rewrite_becomes_header_only_type_one() {
        let p = Path::lookup("/b");
        let mut e = TarEntry::new(PathBuf::from("/src/b"), p, stat(FileKind::Regular, 100), Content::None);
        e.make_hardlink("a".to_string());
        assert_eq!(e.blocked_size, e.header_size);
        assert_eq!(e.header_bytes[e.header_bytes.len() - 512 + 156], TYPE_HARDLINK);
    }

    #[test]
    fn checksum_is_sum_of_header_bytes_with_chksum_as_spaces() {
        let p = Path::lookup("/x");
        let e = TarEntry::new(PathBuf::from("/src/x"), p, stat(FileKind::Regular, 5), Content::None);
        let header = &e.header_bytes[..512];
        let mut scratch = header.to_vec();
        scratch[148..156].copy_from_slice(b"        ");
        let expected: u32 = scratch.iter().map(|b| *b as u32).sum();
        let cs_str = std::str::from_utf8(&header[148..154]).unwrap();
        let got = u32::from_str_radix(cs_str, 8).unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn copy_pads_trailing_partial_block_with_nul() {
        let p = Path::lookup("/x");
        let e = TarEntry::new(
            PathBuf::from("/src/x"),
            p,
            stat(FileKind::Regular, 5),
            Content::InMemory(b"hello".to_vec()),
        );
        let fs = crate::filesystem::RealFileSystem::new();
        let mut buf = vec![0xffu8; e.blocked_size as usize];
        let n = e.copy(&fs, &mut buf, 0).unwrap();
        assert_eq!(n, e.blocked_size as usize);
        let content_start = e.header_size as usize;
        assert_eq!(&buf[content_start..content_start + 5], b"hello");
        assert!(buf[content_start + 5..].iter().all(|b| *b == 0));
    }
}
