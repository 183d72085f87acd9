//! The polymorphic filesystem abstraction (spec §9 design note): the
//! engine never calls `std::fs` directly, it talks to a `FileSystem`
//! implementation picked by dependency injection at mount time. Concrete
//! variants: the real OS, a stat-only in-memory index (for tests), and a
//! mapping filesystem that re-presents existing files under new paths.
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path as StdPath, PathBuf};

/// The kind of a filesystem object (spec §3 `FileStat`).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
    Fifo,
    CharDevice,
    BlockDevice,
    Socket,
}

/// A point in time with second + nanosecond resolution.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

/// Everything the engine needs to know about one filesystem object,
/// independent of where it came from (spec §3).
#[derive(Clone, Debug)]
pub struct FileStat {
    pub kind: FileKind,
    /// 12 permission bits: rwxrwxrwx plus setuid/setgid/sticky.
    pub perm: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub nlink: u64,
    /// Inode number, used to detect hard links to the same content.
    pub ino: u64,
    /// Device number the inode lives on; hard-link grouping is only valid
    /// within a single device.
    pub dev: u64,
    /// Populated for `FileKind::Symlink`.
    pub link_target: Option<String>,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Abstraction over "a tree we can stat, walk, and read bytes from."
/// Mirrors the original's filesystem interface (spec design note §9):
/// `stat`, `recurse`, `pread`, `readlink`, plus file lifecycle operations
/// used by whichever side is producing content (temp files for
/// manifest staging).
pub trait FileSystem {
    fn stat(&self, path: &StdPath) -> io::Result<FileStat>;

    /// Walk `root` depth-first. `visit` is called with each path (root
    /// included) and its stat; returning `Ok(false)` for a directory skips
    /// recursing into it (used to implement `.beak` sub-backup exclusion
    /// one level up, in the forward engine).
    fn recurse(
        &self,
        root: &StdPath,
        visit: &mut dyn FnMut(&StdPath, &FileStat) -> io::Result<bool>,
    ) -> io::Result<()>;

    fn pread(&self, path: &StdPath, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    fn readlink(&self, path: &StdPath) -> io::Result<String>;

    /// Sorted immediate children of a directory, by full path. Exposed
    /// separately from `recurse` so callers can look ahead at a
    /// directory's children (e.g. to detect a `.beak` sub-backup marker)
    /// before deciding whether to descend into it at all.
    fn list_dir(&self, path: &StdPath) -> io::Result<Vec<PathBuf>>;

    fn create_file(&self, path: &StdPath) -> io::Result<()>;

    fn delete_file(&self, path: &StdPath) -> io::Result<()>;
}

/// The real, OS-backed filesystem.
pub struct RealFileSystem;

impl RealFileSystem {
    pub fn new() -> RealFileSystem {
        RealFileSystem
    }

    fn stat_from_metadata(meta: &fs::Metadata, link_target: Option<String>) -> FileStat {
        let file_type = meta.file_type();
        let kind = if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_symlink() {
            FileKind::Symlink
        } else if file_type.is_fifo() {
            FileKind::Fifo
        } else if file_type.is_char_device() {
            FileKind::CharDevice
        } else if file_type.is_block_device() {
            FileKind::BlockDevice
        } else if file_type.is_socket() {
            FileKind::Socket
        } else {
            FileKind::Regular
        };
        FileStat {
            kind,
            perm: meta.mode() & 0o7777,
            uid: meta.uid(),
            gid: meta.gid(),
            rdev: meta.rdev(),
            size: meta.size(),
            atime: Timespec { sec: meta.atime(), nsec: meta.atime_nsec() },
            mtime: Timespec { sec: meta.mtime(), nsec: meta.mtime_nsec() },
            ctime: Timespec { sec: meta.ctime(), nsec: meta.ctime_nsec() },
            nlink: meta.nlink(),
            ino: meta.ino(),
            dev: meta.dev(),
            link_target,
        }
    }
}

impl Default for RealFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

use std::os::unix::fs::FileTypeExt;

impl FileSystem for RealFileSystem {
    fn stat(&self, path: &StdPath) -> io::Result<FileStat> {
        let meta = fs::symlink_metadata(path)?;
        let link_target = if meta.file_type().is_symlink() {
            Some(fs::read_link(path)?.to_string_lossy().into_owned())
        } else {
            None
        };
        Ok(Self::stat_from_metadata(&meta, link_target))
    }

    fn recurse(
        &self,
        root: &StdPath,
        visit: &mut dyn FnMut(&StdPath, &FileStat) -> io::Result<bool>,
    ) -> io::Result<()> {
        let stat = self.stat(root)?;
        let descend = visit(root, &stat)?;
        if stat.is_dir() && descend {
            for child in self.list_dir(root)? {
                self.recurse(&child, visit)?;
            }
        }
        Ok(())
    }

    fn pread(&self, path: &StdPath, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let file = fs::File::open(path)?;
        file.read_at(buf, offset)
    }

    fn readlink(&self, path: &StdPath) -> io::Result<String> {
        Ok(fs::read_link(path)?.to_string_lossy().into_owned())
    }

    fn list_dir(&self, path: &StdPath) -> io::Result<Vec<PathBuf>> {
        let mut children: Vec<PathBuf> =
            fs::read_dir(path)?.filter_map(|e| e.ok()).map(|e| e.path()).collect();
        children.sort();
        Ok(children)
    }

    fn create_file(&self, path: &StdPath) -> io::Result<()> {
        fs::File::create(path).map(|_| ())
    }

    fn delete_file(&self, path: &StdPath) -> io::Result<()> {
        fs::remove_file(path)
    }
}

/// An in-memory, stat-only filesystem: a fixed index of paths to
/// `FileStat` plus byte content, with no backing real files. Used for
/// deterministic tests of the forward engine's selection/grouping logic
/// without touching disk.
#[derive(Default)]
pub struct StatOnlyFileSystem {
    entries: BTreeMap<PathBuf, FileStat>,
    content: BTreeMap<PathBuf, Vec<u8>>,
    children: BTreeMap<PathBuf, Vec<PathBuf>>,
}

impl StatOnlyFileSystem {
    pub fn new() -> StatOnlyFileSystem {
        StatOnlyFileSystem::default()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, stat: FileStat, content: Vec<u8>) {
        let path = path.into();
        if let Some(parent) = path.parent() {
            self.children.entry(parent.to_path_buf()).or_default().push(path.clone());
        }
        self.content.insert(path.clone(), content);
        self.entries.insert(path, stat);
    }
}

impl FileSystem for StatOnlyFileSystem {
    fn stat(&self, path: &StdPath) -> io::Result<FileStat> {
        self.entries
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such path in index"))
    }

    fn recurse(
        &self,
        root: &StdPath,
        visit: &mut dyn FnMut(&StdPath, &FileStat) -> io::Result<bool>,
    ) -> io::Result<()> {
        let stat = self.stat(root)?;
        let descend = visit(root, &stat)?;
        if stat.is_dir() && descend {
            if let Some(children) = self.children.get(root) {
                let mut sorted = children.clone();
                sorted.sort();
                for child in sorted {
                    self.recurse(&child, visit)?;
                }
            }
        }
        Ok(())
    }

    fn pread(&self, path: &StdPath, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let data = self
            .content
            .get(path)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no such path in index"))?;
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn readlink(&self, path: &StdPath) -> io::Result<String> {
        self.entries
            .get(path)
            .and_then(|s| s.link_target.clone())
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "not a symlink"))
    }

    fn list_dir(&self, path: &StdPath) -> io::Result<Vec<PathBuf>> {
        let mut children = self.children.get(path).cloned().unwrap_or_default();
        children.sort();
        Ok(children)
    }

    fn create_file(&self, _path: &StdPath) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "read-only index"))
    }

    fn delete_file(&self, _path: &StdPath) -> io::Result<()> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "read-only index"))
    }
}

/// Re-presents files from a backing `FileSystem` under a different path
/// prefix, without copying: every operation strips `virtual_root` and
/// replays it under `real_root` against the wrapped filesystem. Used to
/// synthesize a view of a subtree as if it were mounted at the scan root.
pub struct MappingFileSystem<F: FileSystem> {
    inner: F,
    virtual_root: PathBuf,
    real_root: PathBuf,
}

impl<F: FileSystem> MappingFileSystem<F> {
    pub fn new(inner: F, virtual_root: impl Into<PathBuf>, real_root: impl Into<PathBuf>) -> Self {
        MappingFileSystem { inner, virtual_root: virtual_root.into(), real_root: real_root.into() }
    }

    fn remap(&self, path: &StdPath) -> PathBuf {
        match path.strip_prefix(&self.virtual_root) {
            Ok(rest) => self.real_root.join(rest),
            Err(_) => path.to_path_buf(),
        }
    }
}

impl<F: FileSystem> FileSystem for MappingFileSystem<F> {
    fn stat(&self, path: &StdPath) -> io::Result<FileStat> {
        self.inner.stat(&self.remap(path))
    }

    fn recurse(
        &self,
        root: &StdPath,
        visit: &mut dyn FnMut(&StdPath, &FileStat) -> io::Result<bool>,
    ) -> io::Result<()> {
        self.inner.recurse(&self.remap(root), visit)
    }

    fn pread(&self, path: &StdPath, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.inner.pread(&self.remap(path), buf, offset)
    }

    fn readlink(&self, path: &StdPath) -> io::Result<String> {
        self.inner.readlink(&self.remap(path))
    }

    fn list_dir(&self, path: &StdPath) -> io::Result<Vec<PathBuf>> {
        let real_children = self.inner.list_dir(&self.remap(path))?;
        Ok(real_children
            .into_iter()
            .map(|c| match c.strip_prefix(&self.real_root) {
                Ok(rest) => self.virtual_root.join(rest),
                Err(_) => c,
            })
            .collect())
    }

    fn create_file(&self, path: &StdPath) -> io::Result<()> {
        self.inner.create_file(&self.remap(path))
    }

    fn delete_file(&self, path: &StdPath) -> io::Result<()> {
        self.inner.delete_file(&self.remap(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_stat(kind: FileKind, size: u64) -> FileStat {
        FileStat {
            kind,
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
    fn stat_only_filesystem_recurses_in_sorted_order() {
        let mut fs = StatOnlyFileSystem::new();
        fs.insert("/root", dummy_stat(FileKind::Directory, 0), vec![]);
        fs.insert("/root/b", dummy_stat(FileKind::Regular, 3), b"abc".to_vec());
        fs.insert("/root/a", dummy_stat(FileKind::Regular, 5), b"hello".to_vec());

        let mut seen = Vec::new();
        fs.recurse(StdPath::new("/root"), &mut |p, _| {
            seen.push(p.to_path_buf());
            Ok(true)
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![PathBuf::from("/root"), PathBuf::from("/root/a"), PathBuf::from("/root/b")]
        );
    }

    #[test]
    fn stat_only_filesystem_pread_clips_at_eof() {
        let mut fs = StatOnlyFileSystem::new();
        fs.insert("/root/a", dummy_stat(FileKind::Regular, 5), b"hello".to_vec());
        let mut buf = [0u8; 10];
        let n = fs.pread(StdPath::new("/root/a"), &mut buf, 3).unwrap();
        assert_eq!(&buf[..n], b"lo");
        let n0 = fs.pread(StdPath::new("/root/a"), &mut buf, 5).unwrap();
        assert_eq!(n0, 0);
    }

    #[test]
    fn mapping_filesystem_remaps_paths() {
        let mut inner = StatOnlyFileSystem::new();
        inner.insert("/real/a", dummy_stat(FileKind::Regular, 5), b"hello".to_vec());
        let mapped = MappingFileSystem::new(inner, "/virt", "/real");
        let stat = mapped.stat(StdPath::new("/virt/a")).unwrap();
        assert_eq!(stat.size, 5);
    }
}
