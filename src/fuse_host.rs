//! The FUSE host adapter (spec §2 item 9, §9 design note "filesystem
//! abstraction"): translates `fuser::Filesystem` callbacks into calls
//! against a [`ForwardEngine`] or [`ReverseEngine`], assigning inode
//! numbers to interned [`Path`]s on first lookup the way the teacher's
//! `CcFs` assigns them to `Index` vec positions. Contains no engine logic
//! of its own, only translation — the tar-synthesis and reconstruction
//! logic this crate cares about lives entirely in `forward.rs`/`reverse.rs`.
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Mutex;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, MountOption, ReplyAttr, ReplyData, ReplyDirectory, ReplyEntry, ReplyOpen, Request,
};
use libc::ENOENT;

use crate::error::EngineError;
use crate::filesystem::{FileKind, Timespec};
use crate::forward::ForwardEngine;
use crate::reverse::ReverseEngine;

/// Time to retain lookups for, matching the teacher's `fs.rs::TTL`.
const TTL: Duration = Duration::new(1, 0);
const ROOT_INODE: u64 = 1;

/// What any synthesized-or-reconstructed object looks like to FUSE,
/// independent of which engine produced it.
pub struct EngineStat {
    pub kind: FileKind,
    pub perm: u16,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: Timespec,
}

/// Engines expose this uniform surface to the FUSE host; `ForwardEngine`
/// and `ReverseEngine` each implement it by converting their own stat
/// type (spec §4.10 / §4.11).
pub trait EngineAdapter {
    fn stat(&self, path: &str) -> Result<EngineStat, EngineError>;
    fn readdir(&self, path: &str) -> Result<Vec<String>, EngineError>;
    fn readlink(&self, path: &str) -> Result<String, EngineError>;
    fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize, EngineError>;
}

impl EngineAdapter for ForwardEngine {
    fn stat(&self, path: &str) -> Result<EngineStat, EngineError> {
        let s = self.getattr(path)?;
        Ok(EngineStat {
            kind: if s.is_dir { FileKind::Directory } else { FileKind::Regular },
            perm: if s.is_dir { 0o500 } else { 0o400 },
            nlink: if s.is_dir { 2 } else { 1 },
            uid: 0,
            gid: 0,
            size: s.size,
            mtime: s.mtime,
        })
    }

    fn readdir(&self, path: &str) -> Result<Vec<String>, EngineError> {
        ForwardEngine::readdir(self, path)
    }

    fn readlink(&self, _path: &str) -> Result<String, EngineError> {
        // Every synthesized tar/manifest file is a regular file; the
        // forward view never presents a symlink of its own.
        Err(EngineError::NotFound(_path.to_string()))
    }

    fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize, EngineError> {
        ForwardEngine::read(self, path, buf, offset)
    }
}

impl EngineAdapter for ReverseEngine {
    fn stat(&self, path: &str) -> Result<EngineStat, EngineError> {
        let s = self.getattr(path)?;
        let nlink = if s.kind == FileKind::Directory { 2 } else { 1 };
        Ok(EngineStat { kind: s.kind, perm: s.perm as u16, nlink, uid: s.uid, gid: s.gid, size: s.size, mtime: s.mtime })
    }

    fn readdir(&self, path: &str) -> Result<Vec<String>, EngineError> {
        ReverseEngine::readdir(self, path)
    }

    fn readlink(&self, path: &str) -> Result<String, EngineError> {
        ReverseEngine::readlink(self, path)
    }

    fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize, EngineError> {
        ReverseEngine::read(self, path, buf, offset)
    }
}

fn to_file_type(kind: FileKind) -> FileType {
    match kind {
        FileKind::Regular => FileType::RegularFile,
        FileKind::Directory => FileType::Directory,
        FileKind::Symlink => FileType::Symlink,
        FileKind::Fifo => FileType::NamedPipe,
        FileKind::CharDevice => FileType::CharDevice,
        FileKind::BlockDevice => FileType::BlockDevice,
        FileKind::Socket => FileType::Socket,
    }
}

fn to_file_attr(ino: u64, stat: &EngineStat) -> FileAttr {
    let mtime = UNIX_EPOCH + Duration::new(stat.mtime.sec.max(0) as u64, stat.mtime.nsec.max(0) as u32);
    FileAttr {
        ino,
        size: stat.size,
        blocks: (stat.size + 511) / 512,
        atime: mtime,
        mtime,
        ctime: mtime,
        crtime: mtime,
        kind: to_file_type(stat.kind),
        perm: stat.perm,
        nlink: stat.nlink,
        uid: stat.uid,
        gid: stat.gid,
        rdev: 0,
        flags: 0,
        blksize: 512,
    }
}

/// Bidirectional inode ↔ path-string table, assigned on first lookup.
/// The root is always inode 1, matching the teacher's convention.
struct InodeTable {
    paths: Vec<String>,
    by_path: HashMap<String, u64>,
}

impl InodeTable {
    fn new() -> InodeTable {
        InodeTable { paths: vec!["/".to_string()], by_path: HashMap::from([("/".to_string(), ROOT_INODE)]) }
    }

    fn path_of(&self, ino: u64) -> Option<&str> {
        self.paths.get((ino - 1) as usize).map(|s| s.as_str())
    }

    fn intern(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.by_path.get(path) {
            return *ino;
        }
        self.paths.push(path.to_string());
        let ino = self.paths.len() as u64;
        self.by_path.insert(path.to_string(), ino);
        ino
    }
}

/// Generic FUSE host: binds any [`EngineAdapter`] (forward or reverse) to
/// actual FUSE calls. Mirrors the teacher's `CcFs`'s method shapes, but
/// dispatches by path instead of by pre-built inode vector, since both
/// engines key their own state by `Path` rather than a flat index.
pub struct BeakFuse<E: EngineAdapter> {
    engine: E,
    inodes: Mutex<InodeTable>,
}

impl<E: EngineAdapter> BeakFuse<E> {
    pub fn new(engine: E) -> BeakFuse<E> {
        BeakFuse { engine, inodes: Mutex::new(InodeTable::new()) }
    }

    fn child_path(parent_path: &str, name: &str) -> String {
        if parent_path == "/" {
            format!("/{}", name)
        } else {
            format!("{}/{}", parent_path, name)
        }
    }
}

impl<E: EngineAdapter> Filesystem for BeakFuse<E> {
    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name = match name.to_str() {
            Some(s) => s,
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let mut inodes = self.inodes.lock().unwrap();
        let parent_path = match inodes.path_of(parent) {
            Some(p) => p.to_string(),
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let child_path = Self::child_path(&parent_path, name);
        match self.engine.stat(&child_path) {
            Ok(stat) => {
                let ino = inodes.intern(&child_path);
                reply.entry(&TTL, &to_file_attr(ino, &stat), 0);
            }
            Err(_) => reply.error(ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        let inodes = self.inodes.lock().unwrap();
        let path = match inodes.path_of(ino) {
            Some(p) => p.to_string(),
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        match self.engine.stat(&path) {
            Ok(stat) => reply.attr(&TTL, &to_file_attr(ino, &stat)),
            Err(_) => reply.error(ENOENT),
        }
    }

    fn readdir(&mut self, _req: &Request, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let mut inodes = self.inodes.lock().unwrap();
        let path = match inodes.path_of(ino) {
            Some(p) => p.to_string(),
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        let names = match self.engine.readdir(&path) {
            Ok(n) => n,
            Err(_) => {
                reply.error(ENOENT);
                return;
            }
        };
        for (i, name) in names.iter().enumerate().skip(offset as usize) {
            let (child_ino, kind) = if name == "." {
                (ino, FileType::Directory)
            } else if name == ".." {
                (ino, FileType::Directory) // the root has no parent to distinguish; acceptable for a read-only mount
            } else {
                let child_path = Self::child_path(&path, name);
                let stat = match self.engine.stat(&child_path) {
                    Ok(s) => s,
                    Err(_) => continue,
                };
                (inodes.intern(&child_path), to_file_type(stat.kind))
            };
            if reply.add(child_ino, (i + 1) as i64, kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        let inodes = self.inodes.lock().unwrap();
        let path = match inodes.path_of(ino) {
            Some(p) => p.to_string(),
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        match self.engine.readlink(&path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(_) => reply.error(ENOENT),
        }
    }

    fn open(&mut self, _req: &Request, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let inodes = self.inodes.lock().unwrap();
        let path = match inodes.path_of(ino) {
            Some(p) => p.to_string(),
            None => {
                reply.error(ENOENT);
                return;
            }
        };
        drop(inodes);
        let mut buf = vec![0u8; size as usize];
        match self.engine.read(&path, &mut buf, offset.max(0) as u64) {
            Ok(n) => reply.data(&buf[..n]),
            Err(e) => reply.error(e.to_errno()),
        }
    }
}

/// spec §6 mount options: read-only, in-kernel permission checks, no
/// atime updates — the same selection the teacher's `fs::mount` makes,
/// minus `Suid`/`Exec`/`Async` which don't apply to a synthetic archive
/// view (there is nothing executable or setuid to honor, and every read
/// is already a blocking `pread` per spec §5).
pub fn default_mount_options(fs_name: &str) -> Vec<MountOption> {
    vec![
        MountOption::FSName(fs_name.to_string()),
        MountOption::DefaultPermissions,
        MountOption::RO,
        MountOption::NoAtime,
    ]
}

pub fn mount_forward(engine: ForwardEngine, mount_point: &str) -> std::io::Result<()> {
    let options = default_mount_options("beakfs");
    fuser::mount2(BeakFuse::new(engine), mount_point, &options)
}

pub fn mount_reverse(engine: ReverseEngine, mount_point: &str) -> std::io::Result<()> {
    let options = default_mount_options("beakfs-reverse");
    fuser::mount2(BeakFuse::new(engine), mount_point, &options)
}
