//! `TarFile`: an ordered, contiguously-blocked collection of `TarEntry`s
//! (spec §3, §4.10.2).
use std::collections::HashMap;
use std::io;

use crate::filesystem::{FileSystem, Timespec};
use crate::path::Path;
use crate::tarentry::TarEntry;

/// Which kind of synthetic tar this is (spec §3, §4.8).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TarFileKind {
    /// `z`: a storage directory's own manifest-bearing entries.
    DirManifestData,
    /// `r`: a small-file bucket.
    SmallBucket,
    /// `m`: a medium-file bucket.
    MediumBucket,
    /// `l`: one large file per tar.
    LargeSingle,
    /// `.gz`: the gzipped manifest index.
    ManifestIndex,
}

impl TarFileKind {
    pub fn type_letter(&self) -> char {
        match self {
            TarFileKind::DirManifestData => 'z',
            TarFileKind::SmallBucket => 'r',
            TarFileKind::MediumBucket => 'm',
            TarFileKind::LargeSingle => 'l',
            TarFileKind::ManifestIndex => 'z',
        }
    }
}

/// An ordered collection of tar entries, laid out contiguously with
/// 512-byte blocking (spec §3).
#[derive(Clone, Debug)]
pub struct TarFile {
    pub name: String,
    pub kind: TarFileKind,
    /// `(offset, entry key)` pairs, offsets strictly increasing, each
    /// equal to the sum of preceding `blocked_size`s.
    pub entries: Vec<(u64, Path)>,
    pub total_size: u64,
    pub mtime: Timespec,
    pub content_hash: String,
}

impl TarFile {
    pub fn new(kind: TarFileKind) -> TarFile {
        TarFile {
            name: String::new(),
            kind,
            entries: Vec::new(),
            total_size: 0,
            mtime: Timespec::default(),
            content_hash: String::new(),
        }
    }

    /// Appends `entry` at the current end of the tar, updating
    /// `total_size` and `mtime`. The caller is responsible for presenting
    /// entries in tar-friendly order before calling this.
    pub fn push(&mut self, key: Path, entry: &TarEntry) {
        let offset = self.total_size;
        self.entries.push((offset, key));
        self.total_size += entry.blocked_size;
        if entry.stat.mtime > self.mtime {
            self.mtime = entry.stat.mtime;
        }
    }

    /// Binary-searches the offset table for the entry spanning `offset`,
    /// then walks forward delegating to `TarEntry::copy` until `buf` is
    /// exhausted or entries run out (spec §4.10.2).
    pub fn copy(
        &self,
        entries: &HashMap<Path, TarEntry>,
        fs: &dyn FileSystem,
        buf: &mut [u8],
        offset: u64,
    ) -> io::Result<usize> {
        if offset >= self.total_size || buf.is_empty() {
            return Ok(0);
        }
        let start_idx = match self.entries.binary_search_by(|(o, _)| o.cmp(&offset)) {
            Ok(i) => i,
            Err(0) => return Ok(0),
            Err(i) => i - 1,
        };

        let mut copied = 0usize;
        let mut cursor = offset;
        for (entry_offset, key) in &self.entries[start_idx..] {
            if copied >= buf.len() {
                break;
            }
            let entry = entries
                .get(key)
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "dangling tar entry key"))?;
            if cursor >= entry_offset + entry.blocked_size {
                continue;
            }
            let local_from = cursor - entry_offset;
            let n = entry.copy(fs, &mut buf[copied..], local_from)?;
            if n == 0 {
                break;
            }
            copied += n;
            cursor += n as u64;
        }
        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::{FileKind, FileStat};
    use crate::tarentry::Content;
    use std::path::PathBuf;

    fn stat(size: u64) -> FileStat {
        FileStat {
            kind: FileKind::Regular,
            perm: 0o644,
            uid: 0,
            gid: 0,
            rdev: 0,
            size,
            atime: Timespec::default(),
            mtime: Timespec::default(),
            ctime: Timespec::default(),
            nlink: 1,
            ino: 1,
            dev: 1,
            link_target: None,
        }
    }

    #[test]
    fn offsets_are_strictly_increasing_sums_of_blocked_sizes() {
        let mut map = HashMap::new();
        let mut tf = TarFile::new(TarFileKind::SmallBucket);

        let px = Path::lookup("/x");
        let ex = TarEntry::new(PathBuf::from("/src/x"), px, stat(5), Content::InMemory(b"hello".to_vec()));
        tf.push(px, &ex);
        map.insert(px, ex.clone());

        let py = Path::lookup("/y");
        let ey = TarEntry::new(PathBuf::from("/src/y"), py, stat(3), Content::InMemory(b"abc".to_vec()));
        tf.push(py, &ey);
        map.insert(py, ey.clone());

        assert_eq!(tf.entries[0].0, 0);
        assert_eq!(tf.entries[1].0, ex.blocked_size);
        assert_eq!(tf.total_size, ex.blocked_size + ey.blocked_size);
    }

    #[test]
    fn copy_dispatches_across_entry_boundaries() {
        let mut map = HashMap::new();
        let mut tf = TarFile::new(TarFileKind::SmallBucket);
        let px = Path::lookup("/x");
        let ex = TarEntry::new(PathBuf::from("/src/x"), px, stat(5), Content::InMemory(b"hello".to_vec()));
        tf.push(px, &ex);
        map.insert(px, ex.clone());
        let py = Path::lookup("/y");
        let ey = TarEntry::new(PathBuf::from("/src/y"), py, stat(3), Content::InMemory(b"abc".to_vec()));
        tf.push(py, &ey);
        map.insert(py, ey.clone());

        let fs = crate::filesystem::RealFileSystem::new();
        let mut buf = vec![0u8; 1024];
        let n = tf.copy(&map, &fs, &mut buf, ex.header_size).unwrap();
        assert_eq!(&buf[..5], b"hello");
        assert!(n > 0);
    }
}
