//! The forward tar-synthesis engine (spec §4.4–§4.10): scan a source
//! tree, select storage directories, partition entries into buckets,
//! hash/name the resulting tars, and serve `getattr`/`readdir`/`read`.
use std::collections::{HashMap, HashSet};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Mutex;

use log::debug;

use crate::error::EngineError;
use crate::filesystem::{FileKind, FileStat, FileSystem, Timespec};
use crate::hash::{short_hex, RollingHasher};
use crate::manifest::{build_manifest_tar_bytes, Manifest, ManifestFileEntry, ManifestHeader, MANIFEST_VERSION};
use crate::matchglob::{Filters, Match};
use crate::path::Path;
use crate::tarentry::{Content, HardLinkState, TarEntry};
use crate::tarfile::{TarFile, TarFileKind};

pub const DEFAULT_TARGET_SIZE: u64 = 10 * 1024 * 1024;

#[derive(Clone)]
pub struct ForwardConfig {
    pub forced_depth: u32,
    pub filters: Filters,
    pub trigger_globs: Vec<Match>,
    pub target_size: u64,
    pub trigger_size: u64,
    pub message: String,
}

impl Default for ForwardConfig {
    fn default() -> ForwardConfig {
        ForwardConfig {
            forced_depth: 2,
            filters: Filters::new(),
            trigger_globs: Vec::new(),
            target_size: DEFAULT_TARGET_SIZE,
            trigger_size: 2 * DEFAULT_TARGET_SIZE,
            message: String::new(),
        }
    }
}

impl ForwardConfig {
    fn small_size(&self) -> u64 {
        self.target_size / 100
    }
}

/// A storage directory's synthesized view: its tar files and the
/// manifest archive describing them.
struct StorageDir {
    tars: Vec<TarFile>,
    manifest_bytes: Vec<u8>,
    manifest_name: String,
    sub_storage_dirs: Vec<Path>,
    mtime: Timespec,
    /// Where each of this directory's (non-sub-storage-dir) members
    /// landed: tar file name and byte offset within it.
    locations: HashMap<Path, (String, u64)>,
}

/// The forward engine: owns the scanned tree and the synthesized tar
/// collections, and serves filesystem requests against them.
pub struct ForwardEngine {
    fs: Box<dyn FileSystem + Send + Sync>,
    root_abspath: PathBuf,
    entries: HashMap<Path, TarEntry>,
    storage_dirs: HashSet<Path>,
    dirs: HashMap<Path, StorageDir>,
    // Single mutex guards the serve path (spec §5).
    lock: Mutex<()>,
}

fn io_err(path: &Path, e: std::io::Error) -> EngineError {
    EngineError::UnderlyingIo(path.str().to_string(), e)
}

impl ForwardEngine {
    pub fn scan(
        fs: Box<dyn FileSystem + Send + Sync>,
        root_abspath: PathBuf,
        config: ForwardConfig,
    ) -> Result<ForwardEngine, EngineError> {
        let root_path = Path::root();
        let mut entries: HashMap<Path, TarEntry> = HashMap::new();
        let mut children: HashMap<Path, Vec<Path>> = HashMap::new();

        walk(fs.as_ref(), &root_abspath, root_path, &mut entries, &mut children, &config.filters)?;

        check_case_collisions(&entries)?;

        accumulate_sizes(&mut entries, root_path);

        let storage_dirs = select_storage_dirs(&mut entries, &children, root_path, &config);

        let (mut owned_by, mut sub_storage_dirs) =
            attach_entries(&entries, &children, &storage_dirs, root_path);

        rewrite_hardlinks(&mut entries, &mut owned_by, &storage_dirs);

        let mut dirs = build_storage_dirs(&entries, &owned_by, &storage_dirs, &config);
        finalize_manifests(&entries, &mut dirs, &mut sub_storage_dirs, &storage_dirs, &config);

        Ok(ForwardEngine { fs, root_abspath, entries, storage_dirs, dirs, lock: Mutex::new(()) })
    }

    /// spec §4.10 `getattr`.
    pub fn getattr(&self, path: &str) -> Result<SyntheticStat, EngineError> {
        let _guard = self.lock.lock().unwrap();
        let p = Path::lookup(path);
        if self.storage_dirs.contains(&p) {
            let dir = self.dirs.get(&p).ok_or_else(|| EngineError::NotFound(path.to_string()))?;
            return Ok(SyntheticStat { is_dir: true, size: 0, mtime: dir.mtime });
        }
        if let Some(dir_path) = p.parent() {
            if let Some(dir) = self.dirs.get(&dir_path) {
                let name = p.name().as_str();
                if let Some(tar) = dir.tars.iter().find(|t| t.name == name) {
                    return Ok(SyntheticStat { is_dir: false, size: tar.total_size, mtime: tar.mtime });
                }
                if dir.manifest_name == name {
                    return Ok(SyntheticStat {
                        is_dir: false,
                        size: dir.manifest_bytes.len() as u64,
                        mtime: dir.mtime,
                    });
                }
            }
        }
        Err(EngineError::NotFound(path.to_string()))
    }

    /// spec §4.10 `readdir`.
    pub fn readdir(&self, path: &str) -> Result<Vec<String>, EngineError> {
        let _guard = self.lock.lock().unwrap();
        let p = Path::lookup(path);
        let dir = self.dirs.get(&p).ok_or_else(|| EngineError::NotFound(path.to_string()))?;
        let mut names = vec![".".to_string(), "..".to_string()];
        for sub in &dir.sub_storage_dirs {
            names.push(sub.name().as_str().to_string());
        }
        for tar in &dir.tars {
            names.push(tar.name.clone());
        }
        names.push(dir.manifest_name.clone());
        Ok(names)
    }

    /// spec §4.10 `read`.
    pub fn read(&self, path: &str, buf: &mut [u8], offset: u64) -> Result<usize, EngineError> {
        let _guard = self.lock.lock().unwrap();
        let p = Path::lookup(path);
        let dir_path = p.parent().ok_or_else(|| EngineError::NotFound(path.to_string()))?;
        let dir = self.dirs.get(&dir_path).ok_or_else(|| EngineError::NotFound(path.to_string()))?;
        let name = p.name().as_str();
        if dir.manifest_name == name {
            let start = offset as usize;
            if start >= dir.manifest_bytes.len() {
                return Ok(0);
            }
            let n = buf.len().min(dir.manifest_bytes.len() - start);
            buf[..n].copy_from_slice(&dir.manifest_bytes[start..start + n]);
            return Ok(n);
        }
        let tar = dir.tars.iter().find(|t| t.name == name).ok_or_else(|| EngineError::NotFound(path.to_string()))?;
        tar.copy(&self.entries, self.fs.as_ref(), buf, offset).map_err(|e| io_err(&p, e))
    }
}

pub struct SyntheticStat {
    pub is_dir: bool,
    pub size: u64,
    pub mtime: Timespec,
}

fn walk(
    fs: &dyn FileSystem,
    abspath: &std::path::Path,
    path: Path,
    entries: &mut HashMap<Path, TarEntry>,
    children: &mut HashMap<Path, Vec<Path>>,
    filters: &Filters,
) -> Result<(), EngineError> {
    let stat = fs.stat(abspath).map_err(|e| io_err(&path, e))?;
    if stat.kind == FileKind::Socket {
        return Ok(());
    }
    if !path.is_root() {
        let filter_path = if stat.is_dir() { format!("{}/", path.str()) } else { path.str().to_string() };
        if !filters.is_kept(&filter_path) {
            return Ok(());
        }
    }

    let content = if stat.kind == FileKind::Regular { Content::RealFile(abspath.to_path_buf()) } else { Content::None };
    let entry = TarEntry::new(abspath.to_path_buf(), path, stat.clone(), content);
    entries.insert(path, entry);

    if stat.is_dir() {
        let names = fs.list_dir(abspath).map_err(|e| io_err(&path, e))?;
        let has_beak_marker = names.iter().any(|c| c.file_name() == Some(OsStr::new(".beak")));
        if has_beak_marker {
            debug!(target: "forward", "sub-backup exclusion beneath {}", path);
            children.insert(path, Vec::new());
            return Ok(());
        }
        let mut child_paths = Vec::new();
        for child_abspath in names {
            let name = match child_abspath.file_name() {
                Some(n) => n.to_string_lossy().into_owned(),
                None => continue,
            };
            if name == ".beak" {
                continue;
            }
            let child_path = path.child(&name);
            walk(fs, &child_abspath, child_path, entries, children, filters)?;
            if entries.contains_key(&child_path) {
                child_paths.push(child_path);
            }
        }
        children.insert(path, child_paths);
    }
    Ok(())
}

fn check_case_collisions(entries: &HashMap<Path, TarEntry>) -> Result<(), EngineError> {
    let mut seen: HashMap<String, Path> = HashMap::new();
    let mut paths: Vec<Path> = entries.keys().cloned().collect();
    paths.sort_by_key(|p| p.str());
    for p in paths {
        let lower = p.str().to_lowercase();
        if let Some(existing) = seen.get(&lower) {
            if *existing != p {
                return Err(EngineError::CaseCollision(existing.str().to_string(), p.str().to_string()));
            }
        } else {
            seen.insert(lower, p);
        }
    }
    Ok(())
}

fn depth_first_deepest_first(entries: &HashMap<Path, TarEntry>) -> Vec<Path> {
    let mut v: Vec<Path> = entries.keys().cloned().collect();
    v.sort_by(|a, b| Path::cmp_deepest_first(*a, *b));
    v
}

/// Bottom-up: every entry contributes its own weight (blocked size, plus
/// for directories whatever's already rolled up from its descendants)
/// into its parent's `children_size` (spec §3, §4.4).
fn accumulate_sizes(entries: &mut HashMap<Path, TarEntry>, _root: Path) {
    let order = depth_first_deepest_first(entries);
    for p in order {
        let parent = match p.parent() {
            Some(parent) => parent,
            None => continue,
        };
        let (is_dir, own_blocked, own_children_size) = {
            let e = &entries[&p];
            (e.stat.is_dir(), e.blocked_size, e.children_size)
        };
        let contribution = if is_dir { own_blocked + own_children_size } else { own_blocked };
        if let Some(parent_entry) = entries.get_mut(&parent) {
            parent_entry.children_size += contribution;
        }
    }
}

/// spec §4.4: storage-directory selection, evaluated bottom-up so a
/// promotion's size subtraction is visible to its own ancestors.
fn select_storage_dirs(
    entries: &mut HashMap<Path, TarEntry>,
    _children: &HashMap<Path, Vec<Path>>,
    root: Path,
    config: &ForwardConfig,
) -> HashSet<Path> {
    let mut storage_dirs = HashSet::new();
    let mut dir_paths: Vec<Path> =
        entries.iter().filter(|(_, e)| e.stat.is_dir()).map(|(p, _)| *p).collect();
    dir_paths.sort_by(|a, b| Path::cmp_deepest_first(*a, *b));

    for p in dir_paths {
        if p == root {
            continue;
        }
        let depth = p.depth();
        let children_size = entries[&p].children_size;
        let qualifies = depth <= 1
            || depth == config.forced_depth
            || config.trigger_globs.iter().any(|g| g.matches(p.str()))
            || children_size > config.trigger_size;
        if qualifies {
            storage_dirs.insert(p);
            let subtract = entries[&p].children_size;
            let mut anc = p.parent();
            while let Some(a) = anc {
                if let Some(ae) = entries.get_mut(&a) {
                    ae.children_size = ae.children_size.saturating_sub(subtract);
                }
                anc = a.parent();
            }
        }
    }
    storage_dirs.insert(root);
    for p in &storage_dirs {
        if let Some(e) = entries.get_mut(p) {
            e.is_storage_dir = true;
        }
    }
    storage_dirs
}

fn nearest_storage_ancestor(p: Path, storage_dirs: &HashSet<Path>) -> Path {
    let mut cur = p;
    loop {
        if storage_dirs.contains(&cur) {
            return cur;
        }
        cur = cur.parent().expect("root is always a storage directory");
    }
}

/// spec §4.5: attach every retained path to the nearest storage-directory
/// ancestor, either as a content entry or as a listed sub-storage-dir.
fn attach_entries(
    entries: &HashMap<Path, TarEntry>,
    _children: &HashMap<Path, Vec<Path>>,
    storage_dirs: &HashSet<Path>,
    root: Path,
) -> (HashMap<Path, Vec<Path>>, HashMap<Path, Vec<Path>>) {
    let mut owned_by: HashMap<Path, Vec<Path>> = HashMap::new();
    let mut sub_storage_dirs: HashMap<Path, Vec<Path>> = HashMap::new();
    let mut paths: Vec<Path> = entries.keys().cloned().collect();
    paths.sort_by_key(|p| p.str());
    for p in paths {
        if p == root {
            continue;
        }
        let owner = nearest_storage_ancestor(p.parent().unwrap(), storage_dirs);
        if storage_dirs.contains(&p) {
            sub_storage_dirs.entry(owner).or_default().push(p);
        } else {
            owned_by.entry(owner).or_default().push(p);
        }
    }
    (owned_by, sub_storage_dirs)
}

/// spec §4.6: hard-link pre-pass, post-grouping fix-up, prefix stripping,
/// and the final header-only rewrite of link entries.
fn rewrite_hardlinks(
    entries: &mut HashMap<Path, TarEntry>,
    owned_by: &mut HashMap<Path, Vec<Path>>,
    storage_dirs: &HashSet<Path>,
) {
    let mut groups: HashMap<(u64, u64), Vec<Path>> = HashMap::new();
    let mut paths: Vec<Path> = entries.keys().cloned().collect();
    paths.sort_by_key(|p| p.str());
    for p in &paths {
        let e = &entries[p];
        if !e.stat.is_dir() && e.stat.nlink > 1 {
            groups.entry((e.stat.dev, e.stat.ino)).or_default().push(*p);
        }
    }

    let mut link_to_original: HashMap<Path, Path> = HashMap::new();
    for group in groups.values_mut() {
        group.sort_by_key(|p| p.str());
        let original = group[0];
        for link in &group[1..] {
            link_to_original.insert(*link, original);
        }
    }

    let mut owner_of: HashMap<Path, Path> = HashMap::new();
    for (dir, members) in owned_by.iter() {
        for m in members {
            owner_of.insert(*m, *dir);
        }
    }

    // Post-grouping fix-up: move a link to share its target's storage
    // directory whenever their common ancestor is shallower than the
    // link's own assignment (interpreted here as "reassign to the
    // target's own storage directory" — the simplest assignment that
    // guarantees the link and target land in the same manifest tree;
    // recorded as an explicit decision in DESIGN.md).
    for (link, original) in link_to_original.clone() {
        let common = Path::common_prefix(link, original);
        let link_owner = owner_of[&link];
        let original_owner = owner_of[&original];
        if common.depth() < link_owner.depth() && link_owner != original_owner {
            if let Some(v) = owned_by.get_mut(&link_owner) {
                v.retain(|x| *x != link);
            }
            owned_by.entry(original_owner).or_default().push(link);
            owner_of.insert(link, original_owner);
        }
    }
    let _ = storage_dirs;

    for (dir, members) in owned_by.iter() {
        let n = if dir.is_root() { 0 } else { dir.str().len() };
        for m in members {
            if let Some(e) = entries.get_mut(m) {
                e.remove_prefix(n);
            }
        }
    }

    for (link, original) in &link_to_original {
        let target_tarpath = entries[original].tarpath.clone();
        if let Some(e) = entries.get_mut(link) {
            e.make_hardlink(target_tarpath);
        }
    }
}

fn find_num_tars_from_size(total: u64, target: u64) -> u64 {
    if total == 0 {
        return 1;
    }
    let mut n: u64 = 1;
    while n.saturating_mul(target) < total {
        n *= 2;
    }
    n
}

fn classify_size(e: &TarEntry) -> u64 {
    if matches!(e.hardlink, HardLinkState::Link { .. }) {
        0
    } else {
        e.stat.size
    }
}

/// spec §4.7–§4.8: partition each storage directory's owned entries into
/// dir-manifest/small/medium/large buckets, lay out tar-friendly order,
/// and hash+name the resulting tars.
fn build_storage_dirs(
    entries: &HashMap<Path, TarEntry>,
    owned_by: &HashMap<Path, Vec<Path>>,
    storage_dirs: &HashSet<Path>,
    config: &ForwardConfig,
) -> HashMap<Path, StorageDir> {
    let mut dirs = HashMap::new();

    for dir in storage_dirs {
        let mut members: Vec<Path> = owned_by.get(dir).cloned().unwrap_or_default();
        members.sort_by(|a, b| Path::cmp_tar_friendly(*a, *b));

        let mut dir_members = Vec::new();
        let mut small_members = Vec::new();
        let mut medium_members = Vec::new();
        let mut large_members = Vec::new();

        let small_size = config.small_size();
        let medium_size = config.target_size;

        for m in members {
            let e = &entries[&m];
            if e.stat.is_dir() {
                dir_members.push(m);
                continue;
            }
            let sz = classify_size(e);
            if sz < small_size {
                small_members.push(m);
            } else if sz < medium_size {
                medium_members.push(m);
            } else {
                large_members.push(m);
            }
        }

        let small_total: u64 = small_members.iter().map(|p| entries[p].blocked_size).sum();
        let medium_total: u64 = medium_members.iter().map(|p| entries[p].blocked_size).sum();
        if !medium_members.is_empty() && (small_total <= config.target_size || medium_total <= config.target_size) {
            small_members.append(&mut medium_members);
        }

        let mut tars = Vec::new();
        let mut serial: u64 = 0;

        if !dir_members.is_empty() {
            let mut tf = TarFile::new(TarFileKind::DirManifestData);
            for m in &dir_members {
                tf.push(*m, &entries[m]);
            }
            finalize_tar(&mut tf, entries, serial);
            serial += 1;
            tars.push(tf);
        }

        if !small_members.is_empty() {
            let total: u64 = small_members.iter().map(|p| entries[p].blocked_size).sum();
            let num_tars = find_num_tars_from_size(total, config.target_size);
            let mut buckets: Vec<Vec<Path>> = vec![Vec::new(); num_tars as usize];
            for m in &small_members {
                let idx = (entries[m].tarpath_hash % num_tars) as usize;
                buckets[idx].push(*m);
            }
            for bucket in buckets {
                if bucket.is_empty() {
                    continue;
                }
                let mut tf = TarFile::new(TarFileKind::SmallBucket);
                for m in &bucket {
                    tf.push(*m, &entries[m]);
                }
                finalize_tar(&mut tf, entries, serial);
                serial += 1;
                tars.push(tf);
            }
        }

        if !medium_members.is_empty() {
            let total: u64 = medium_members.iter().map(|p| entries[p].blocked_size).sum();
            let num_tars = find_num_tars_from_size(total, config.target_size);
            let mut buckets: Vec<Vec<Path>> = vec![Vec::new(); num_tars as usize];
            for m in &medium_members {
                let idx = (entries[m].tarpath_hash % num_tars) as usize;
                buckets[idx].push(*m);
            }
            for bucket in buckets {
                if bucket.is_empty() {
                    continue;
                }
                let mut tf = TarFile::new(TarFileKind::MediumBucket);
                for m in &bucket {
                    tf.push(*m, &entries[m]);
                }
                finalize_tar(&mut tf, entries, serial);
                serial += 1;
                tars.push(tf);
            }
        }

        if !large_members.is_empty() {
            let mut by_hash: HashMap<u64, Vec<Path>> = HashMap::new();
            for m in &large_members {
                by_hash.entry(entries[m].tarpath_hash).or_default().push(*m);
            }
            let mut hashes: Vec<u64> = by_hash.keys().cloned().collect();
            hashes.sort();
            for h in hashes {
                let mut tf = TarFile::new(TarFileKind::LargeSingle);
                for m in &by_hash[&h] {
                    tf.push(*m, &entries[m]);
                }
                finalize_tar(&mut tf, entries, serial);
                serial += 1;
                tars.push(tf);
            }
        }

        // The manifest's offset column is a *content* offset (spec §4.9,
        // `examples/original_source/reverse.cc`'s unadorned `pread` at
        // `e.offset`), not the tar-entry's header start, so add
        // `header_size` here before it flows into the manifest line.
        let mut locations: HashMap<Path, (String, u64)> = HashMap::new();
        for tf in &tars {
            for (offset, key) in &tf.entries {
                let content_offset = offset + entries[key].header_size;
                locations.insert(*key, (tf.name.clone(), content_offset));
            }
        }

        dirs.insert(
            *dir,
            StorageDir {
                tars,
                manifest_bytes: Vec::new(),
                manifest_name: String::new(),
                sub_storage_dirs: Vec::new(),
                mtime: Timespec::default(),
                locations,
            },
        );
    }

    dirs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filesystem::{FileKind, StatOnlyFileSystem};
    use std::path::PathBuf;

    fn dir_stat() -> FileStat {
        FileStat {
            kind: FileKind::Directory,
            perm: 0o755,
            uid: 0,
            gid: 0,
            rdev: 0,
            size: 0,
            atime: Timespec::default(),
            mtime: Timespec::default(),
            ctime: Timespec::default(),
            nlink: 2,
            ino: 1,
            dev: 1,
            link_target: None,
        }
    }

    fn file_stat(size: u64, ino: u64, nlink: u64) -> FileStat {
        FileStat {
            kind: FileKind::Regular,
            perm: 0o644,
            uid: 1000,
            gid: 1000,
            rdev: 0,
            size,
            atime: Timespec::default(),
            mtime: Timespec { sec: 1_700_000_000, nsec: 0 },
            ctime: Timespec::default(),
            nlink,
            ino,
            dev: 1,
            link_target: None,
        }
    }

    /// Builds a flat tree: `/src` (root dir) with the given `(name, content)`
    /// files directly beneath it, each with a distinct inode.
    fn flat_fs(files: &[(&str, &[u8])]) -> (StatOnlyFileSystem, PathBuf) {
        let mut fs = StatOnlyFileSystem::new();
        fs.insert("/src", dir_stat(), vec![]);
        for (i, (name, content)) in files.iter().enumerate() {
            fs.insert(
                format!("/src/{}", name),
                file_stat(content.len() as u64, 100 + i as u64, 1),
                content.to_vec(),
            );
        }
        (fs, PathBuf::from("/src"))
    }

    #[test]
    fn s1_two_small_files_land_in_one_bucket_with_manifest() {
        let (fs, root) = flat_fs(&[("x", b"hello"), ("y", b"abc")]);
        let engine = ForwardEngine::scan(Box::new(fs), root, ForwardConfig::default()).unwrap();

        assert_eq!(engine.storage_dirs.len(), 1);
        assert!(engine.storage_dirs.contains(&Path::root()));

        let names = engine.readdir("").unwrap();
        let tar_names: Vec<&String> = names.iter().filter(|n| n.starts_with("tar")).collect();
        assert_eq!(tar_names.len(), 1, "expected exactly one small bucket, got {:?}", names);
        assert!(names.iter().any(|n| n.ends_with(".gz")));

        let tar_name = tar_names[0].clone();
        let tar_path = format!("/{}", tar_name);
        let stat = engine.getattr(&tar_path).unwrap();
        assert!(!stat.is_dir);

        // Reconstruct the full tar and check both files' headers are present
        // in tar-friendly order ("x" before "y", lexicographic).
        let mut buf = vec![0u8; stat.size as usize];
        let n = engine.read(&tar_path, &mut buf, 0).unwrap();
        assert_eq!(n, buf.len());

        let x_name_bytes = &buf[0..100];
        let x_name_str: String = x_name_bytes.iter().take_while(|b| **b != 0).map(|b| *b as char).collect();
        assert_eq!(x_name_str, "x");
        assert_eq!(&buf[512..517], b"hello");

        let y_name_bytes = &buf[1024..1124];
        let y_name_str: String = y_name_bytes.iter().take_while(|b| **b != 0).map(|b| *b as char).collect();
        assert_eq!(y_name_str, "y");
        assert_eq!(&buf[1536..1539], b"abc");
    }

    #[test]
    fn large_file_lands_in_its_own_large_tar() {
        let big = vec![b'z'; 11 * 1024 * 1024];
        let (fs, root) = flat_fs(&[("big", &big)]);
        let engine = ForwardEngine::scan(Box::new(fs), root, ForwardConfig::default()).unwrap();
        let dir = &engine.dirs[&Path::root()];
        assert_eq!(dir.tars.len(), 1);
        assert_eq!(dir.tars[0].kind.type_letter(), 'l');
    }

    #[test]
    fn many_small_files_collapse_into_a_power_of_two_bucket_count() {
        let files: Vec<(String, Vec<u8>)> =
            (0..1000).map(|i| (format!("f{:04}", i), vec![b'a'; 1024])).collect();
        let refs: Vec<(&str, &[u8])> = files.iter().map(|(n, c)| (n.as_str(), c.as_slice())).collect();
        let (fs, root) = flat_fs(&refs);
        let engine = ForwardEngine::scan(Box::new(fs), root, ForwardConfig::default()).unwrap();
        let dir = &engine.dirs[&Path::root()];
        let small_tars = dir.tars.iter().filter(|t| t.kind.type_letter() == 'r').count();
        assert!(small_tars.is_power_of_two());
        assert!(small_tars >= 1);

        let total_members: usize = dir.tars.iter().map(|t| t.entries.len()).sum();
        assert_eq!(total_members, 1000);
    }

    #[test]
    fn second_hardlink_becomes_header_only_link_record() {
        let mut fs = StatOnlyFileSystem::new();
        fs.insert("/src", dir_stat(), vec![]);
        fs.insert("/src/a", file_stat(4, 42, 2), b"data".to_vec());
        fs.insert("/src/b", file_stat(4, 42, 2), b"data".to_vec());
        let engine = ForwardEngine::scan(Box::new(fs), PathBuf::from("/src"), ForwardConfig::default()).unwrap();

        let a = engine.entries.get(&Path::lookup("/a")).unwrap();
        let b = engine.entries.get(&Path::lookup("/b")).unwrap();
        assert!(matches!(a.hardlink, HardLinkState::NotLinked));
        match &b.hardlink {
            HardLinkState::Link { target_tarpath } => assert_eq!(target_tarpath, "a"),
            other => panic!("expected link state, got {:?}", other),
        }
        assert_eq!(b.blocked_size, b.header_size);
    }

    #[test]
    fn changing_one_file_byte_changes_only_its_own_tar_name() {
        let (fs1, root1) = flat_fs(&[("x", b"hello"), ("y", b"abc")]);
        let engine1 = ForwardEngine::scan(Box::new(fs1), root1, ForwardConfig::default()).unwrap();
        let names1: HashSet<String> =
            engine1.readdir("").unwrap().into_iter().filter(|n| n.starts_with("tar")).collect();

        let (fs2, root2) = flat_fs(&[("x", b"hellp"), ("y", b"abc")]);
        let engine2 = ForwardEngine::scan(Box::new(fs2), root2, ForwardConfig::default()).unwrap();
        let names2: HashSet<String> =
            engine2.readdir("").unwrap().into_iter().filter(|n| n.starts_with("tar")).collect();

        // Only one tar file (the single bucket both "x" and "y" share)
        // exists in each run, and its name must differ since its content
        // hash changed.
        assert_eq!(names1.len(), 1);
        assert_eq!(names2.len(), 1);
        assert_ne!(names1, names2);
    }

    #[test]
    fn repeated_scans_of_unchanged_tree_produce_identical_tar_names() {
        let (fs1, root1) = flat_fs(&[("x", b"hello"), ("y", b"abc")]);
        let engine1 = ForwardEngine::scan(Box::new(fs1), root1, ForwardConfig::default()).unwrap();
        let names1: Vec<String> = engine1.readdir("").unwrap();

        let (fs2, root2) = flat_fs(&[("x", b"hello"), ("y", b"abc")]);
        let engine2 = ForwardEngine::scan(Box::new(fs2), root2, ForwardConfig::default()).unwrap();
        let names2: Vec<String> = engine2.readdir("").unwrap();

        assert_eq!(names1, names2);
    }

    /// Materializes every tar/manifest the forward engine synthesizes for
    /// `root` onto a fresh `StatOnlyFileSystem` rooted at `/dst`, the way
    /// an upload would lay them out on a destination store.
    fn materialize(engine: &ForwardEngine) -> crate::filesystem::StatOnlyFileSystem {
        let mut dst = StatOnlyFileSystem::new();
        dst.insert("/dst", dir_stat(), vec![]);
        for name in engine.readdir("").unwrap() {
            if name == "." || name == ".." {
                continue;
            }
            let path = format!("/{}", name);
            let stat = engine.getattr(&path).unwrap();
            if stat.is_dir {
                continue;
            }
            let mut buf = vec![0u8; stat.size as usize];
            engine.read(&path, &mut buf, 0).unwrap();
            dst.insert(format!("/dst/{}", name), file_stat(buf.len() as u64, 900, 1), buf);
        }
        dst
    }

    #[test]
    fn reverse_read_reconstructs_original_file_bytes_not_the_tar_header() {
        let (fs, root) = flat_fs(&[("x", b"hello"), ("y", b"abc")]);
        let engine = ForwardEngine::scan(Box::new(fs), root, ForwardConfig::default()).unwrap();
        let dst = materialize(&engine);

        let reverse = crate::reverse::ReverseEngine::mount(Box::new(dst), PathBuf::from("/dst")).unwrap();

        let x_stat = reverse.getattr("/x").unwrap();
        assert_eq!(x_stat.size, 5);
        let mut buf = vec![0u8; 5];
        let n = reverse.read("/x", &mut buf, 0).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");

        let y_stat = reverse.getattr("/y").unwrap();
        assert_eq!(y_stat.size, 3);
        let mut buf = vec![0u8; 3];
        let n = reverse.read("/y", &mut buf, 0).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn read_past_end_of_tar_returns_zero() {
        let (fs, root) = flat_fs(&[("x", b"hello")]);
        let engine = ForwardEngine::scan(Box::new(fs), root, ForwardConfig::default()).unwrap();
        let names = engine.readdir("").unwrap();
        let tar_name = names.iter().find(|n| n.starts_with("tar")).unwrap().clone();
        let tar_path = format!("/{}", tar_name);
        let stat = engine.getattr(&tar_path).unwrap();

        let mut buf = vec![0u8; 16];
        let n = engine.read(&tar_path, &mut buf, stat.size).unwrap();
        assert_eq!(n, 0);
    }
}

fn finalize_tar(tf: &mut TarFile, entries: &HashMap<Path, TarEntry>, serial: u64) {
    let mut hasher = RollingHasher::new();
    for (_, key) in &tf.entries {
        hasher.update(&entries[key].header_bytes);
    }
    let hash = hasher.finish_hex();
    tf.content_hash = hash.clone();
    tf.name = format!("ta{}{:08x}_{}_{}.tar", tf.kind.type_letter(), serial, short_hex(&hash), tf.total_size);
}

/// spec §4.8–§4.9: build each storage directory's manifest text/archive,
/// computed bottom-up so a directory's mtime and its index's content
/// hash roll up from its own sub-storage-directories.
fn finalize_manifests(
    entries: &HashMap<Path, TarEntry>,
    dirs: &mut HashMap<Path, StorageDir>,
    sub_storage_dirs: &mut HashMap<Path, Vec<Path>>,
    storage_dirs: &HashSet<Path>,
    config: &ForwardConfig,
) {
    let mut ordered: Vec<Path> = storage_dirs.iter().cloned().collect();
    ordered.sort_by(|a, b| Path::cmp_deepest_first(*a, *b));

    for dir in ordered {
        let mut subs = sub_storage_dirs.remove(&dir).unwrap_or_default();
        subs.sort_by(|a, b| Path::cmp_tar_friendly(*a, *b));
        dirs.get_mut(&dir).unwrap().sub_storage_dirs = subs.clone();

        let mut mtime = entries[&dir].stat.mtime;
        for tar in &dirs[&dir].tars {
            if tar.mtime > mtime {
                mtime = tar.mtime;
            }
        }
        for sub in &subs {
            if let Some(sub_dir) = dirs.get(sub) {
                if sub_dir.mtime > mtime {
                    mtime = sub_dir.mtime;
                }
            }
        }

        let mut files = Vec::new();
        let mut uids: HashSet<u32> = HashSet::new();
        let mut gids: HashSet<u32> = HashSet::new();

        // Members and sub-storage-directories share one tar-friendly order
        // (spec §4.9/§8 invariant 3) — sort them together, not members then
        // subs re-sorted by raw path string, which would scatter subdir
        // content away from its own subdirectory line.
        {
            let storage_entry = &dirs[&dir];
            let mut ordered: Vec<Path> = storage_entry.locations.keys().cloned().collect();
            ordered.extend(subs.iter().cloned());
            ordered.sort_by(|a, b| Path::cmp_tar_friendly(*a, *b));

            for m in ordered {
                let e = &entries[&m];
                if let Some((tar_name, offset)) = storage_entry.locations.get(&m).cloned() {
                    let manifest_path = format!("/{}", e.tarpath);
                    files.push(ManifestFileEntry::from_stat(&manifest_path, &e.stat, &tar_name, offset));
                } else {
                    // Sub-storage-directory: record its path relative to
                    // this storage dir, not its bare basename, so that
                    // intervening non-storage-directory components (spec
                    // §4.5) survive for the reverse engine to re-attach.
                    let rel = m.subpath(dir.depth() as usize, None);
                    files.push(ManifestFileEntry::from_stat(rel.str(), &e.stat, "", 0));
                }
                uids.insert(e.stat.uid);
                gids.insert(e.stat.gid);
            }
        }

        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();
        let mut gids: Vec<u32> = gids.into_iter().collect();
        gids.sort_unstable();

        let storage_entry = dirs.get_mut(&dir).unwrap();
        storage_entry.mtime = mtime;
        let manifest = Manifest {
            header: ManifestHeader { version: MANIFEST_VERSION.to_string(), message: config.message.clone(), uids, gids },
            files,
            tars: storage_entry.tars.iter().map(|t| t.name.clone()).collect(),
        };
        let text = crate::manifest::encode_text(&manifest);
        let bytes = build_manifest_tar_bytes(&manifest);

        let mut hasher = RollingHasher::new();
        hasher.update(text.as_bytes());
        for t in &storage_entry.tars {
            hasher.update(t.content_hash.as_bytes());
        }
        let hash = hasher.finish_hex();
        storage_entry.manifest_bytes = bytes;
        storage_entry.manifest_name = format!("ta{:08x}_{}_{}.gz", 0u32, short_hex(&hash), storage_entry.manifest_bytes.len());
    }
}
