//! On-disk artifact cache
//!
//! One [`ArtifactCache`] handle serves one code unit. Opening it derives the
//! unit's cache file from its source path, opens the file and takes an
//! exclusive advisory lock that is held until the handle is dropped, so a
//! second process compiling the same unit waits instead of racing the
//! write. Any failure along the way disables the handle: `load` then misses
//! and `store` does nothing.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use crate::bytecode::CodeUnit;
use crate::jit::runtime::{CompiledArtifact, ExecMemoryArena, StackHeights};

use super::format::{
    decode_rodata, encode_rodata, instruction_hash, rodata_size, RecordHeader, CACHE_SUFFIX,
    FROZEN_TIMESTAMP, RECORD_HEADER_SIZE,
};

/// Error while opening or writing a cache file
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to create cache directory {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[error("Failed to lock {path}: {source}")]
    Lock { path: PathBuf, source: std::io::Error },
    #[error("Source file {0} has no usable modification time")]
    NoSource(String),
}

/// Cache file location for `unit` under `root`
///
/// The source path is mirrored below the root with `.` components dropped
/// and `..` components resolved, then tagged with the unit's first line and
/// a marker for module bodies (`~mod`) and other anonymous units (`~anno`).
pub fn cache_path(root: &Path, unit: &CodeUnit) -> PathBuf {
    let mut path = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(&unit.filename).components() {
        match component {
            Component::Normal(part) => {
                path.push(part);
                depth += 1;
            }
            Component::ParentDir if depth > 0 => {
                path.pop();
                depth -= 1;
            }
            _ => {}
        }
    }

    let mut name = match path.file_name() {
        Some(base) if depth > 0 => base.to_string_lossy().into_owned(),
        _ => String::new(),
    };
    name.push('@');
    name.push_str(&unit.first_line.to_string());
    if unit.is_module() {
        name.push_str("~mod");
    } else if unit.is_anonymous() {
        name.push_str("~anno");
    }
    name.push_str(CACHE_SUFFIX);

    if depth > 0 {
        path.set_file_name(name);
    } else {
        path.push(name);
    }
    path
}

/// Modification timestamp the cache keys `unit` on
pub fn source_timestamp(unit: &CodeUnit) -> Result<i64, CacheError> {
    let filename = &unit.filename;
    match fs::metadata(filename).and_then(|m| m.modified()) {
        Ok(modified) => modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .map_err(|_| CacheError::NoSource(filename.clone())),
        Err(_) if filename.starts_with("<frozen ") && filename.ends_with('>') => Ok(FROZEN_TIMESTAMP),
        Err(_) => Err(CacheError::NoSource(filename.clone())),
    }
}

struct OpenCache {
    file: File,
    path: PathBuf,
}

/// Cache handle for one code unit
pub struct ArtifactCache {
    open: Option<OpenCache>,
    unit_code: Vec<u8>,
    instr_num: usize,
    stacksize: u32,
    anonymous: bool,
    timestamp: i64,
    hash: u64,
    append_at: u64,
}

impl ArtifactCache {
    /// A handle that never hits and never writes
    pub fn disabled(unit: &CodeUnit) -> Self {
        ArtifactCache {
            open: None,
            unit_code: unit.code.clone(),
            instr_num: unit.instr_num(),
            stacksize: unit.stacksize,
            anonymous: unit.is_anonymous(),
            timestamp: 0,
            hash: 0,
            append_at: 0,
        }
    }

    /// Open and lock the cache file for `unit`; without a root, or on any
    /// failure, the handle is disabled
    pub fn open(root: Option<&Path>, unit: &CodeUnit) -> Self {
        let mut cache = Self::disabled(unit);
        let Some(root) = root else {
            return cache;
        };
        match cache.try_open(root, unit) {
            Ok(()) => {
                if let Some(open) = &cache.open {
                    log::debug!("{}: cache file {}", unit.name, open.path.display());
                }
            }
            Err(e) => log::warn!("{}: caching disabled: {}", unit.name, e),
        }
        cache
    }

    fn try_open(&mut self, root: &Path, unit: &CodeUnit) -> Result<(), CacheError> {
        self.timestamp = source_timestamp(unit)?;
        self.hash = instruction_hash(&unit.code);

        let path = cache_path(root, unit);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| CacheError::CreateDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        lock_exclusive(&file).map_err(|source| CacheError::Lock { path: path.clone(), source })?;
        self.open = Some(OpenCache { file, path });
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.open.is_some()
    }

    /// Path of the locked cache file, if the handle is enabled
    pub fn path(&self) -> Option<&Path> {
        self.open.as_ref().map(|o| o.path.as_path())
    }

    /// Look up this unit's record and place it in `arena`
    ///
    /// Short reads, key mismatches and malformed tables are all misses.
    pub fn load(&mut self, arena: &Arc<ExecMemoryArena>) -> Option<CompiledArtifact> {
        let open = self.open.as_mut()?;
        let mut bytes = Vec::new();
        if let Err(e) = open.file.seek(SeekFrom::Start(0)).and_then(|_| open.file.read_to_end(&mut bytes)) {
            log::warn!("failed to read {}: {}", open.path.display(), e);
            return None;
        }

        let mut offset = 0usize;
        loop {
            let rest = bytes.get(offset..)?;
            if rest.len() < RECORD_HEADER_SIZE {
                if rest.is_empty() && self.anonymous {
                    self.append_at = offset as u64;
                }
                return None;
            }
            let header = RecordHeader::decode(&mut &rest[..RECORD_HEADER_SIZE]).ok()?;
            if header.timestamp != self.timestamp {
                return None;
            }
            let key_matches =
                header.unit_size as usize == self.unit_code.len() && header.hash == self.hash;
            let body_start = offset + RECORD_HEADER_SIZE;
            let body_end = body_start + header.body_size(self.anonymous);

            if self.anonymous {
                if !key_matches {
                    offset = body_end;
                    continue;
                }
                let unit_end = body_start + header.unit_size as usize;
                if bytes.get(body_start..unit_end)? != self.unit_code.as_slice() {
                    offset = body_end;
                    continue;
                }
            } else if !key_matches {
                return None;
            }

            let body = bytes.get(body_start..body_end)?;
            return self.materialize(&header, body, arena);
        }
    }

    fn materialize(
        &self,
        header: &RecordHeader,
        body: &[u8],
        arena: &Arc<ExecMemoryArena>,
    ) -> Option<CompiledArtifact> {
        let skip = if self.anonymous { header.unit_size as usize } else { 0 };
        let (code, rodata) = body[skip..].split_at(header.code_size as usize);
        let tables = decode_rodata(rodata, header.handler_num as usize, self.instr_num, self.stacksize)?;

        match CompiledArtifact::new(
            arena,
            code,
            tables.handler_vpcs,
            tables.handler_pcs,
            tables.stack_heights,
            header.opcache_num as usize,
        ) {
            Ok(artifact) => Some(artifact),
            Err(e) => {
                log::warn!("cached code could not be placed: {}", e);
                None
            }
        }
    }

    /// Write `artifact` as this unit's record and truncate the file after it
    pub fn store(&mut self, artifact: &CompiledArtifact) -> Result<(), CacheError> {
        let Some(open) = self.open.as_mut() else {
            return Ok(());
        };

        let header = RecordHeader {
            timestamp: self.timestamp,
            hash: self.hash,
            unit_size: self.unit_code.len() as u32,
            code_size: artifact.code().len() as u32,
            rodata_size: rodata_size(artifact.handler_num(), self.instr_num, self.stacksize) as u32,
            opcache_num: artifact.opcache_num() as u32,
            handler_num: artifact.handler_num() as u32,
        };

        let mut record = Vec::with_capacity(RECORD_HEADER_SIZE + header.body_size(self.anonymous));
        header.encode(&mut record)?;
        if self.anonymous {
            record.extend_from_slice(&self.unit_code);
        }
        record.extend_from_slice(artifact.code());
        let wide: Vec<u16> = (0..artifact.stack_heights().len())
            .filter_map(|vpc| artifact.stack_height(vpc))
            .map(|h| h as u16)
            .collect();
        debug_assert_eq!(wide.len(), self.instr_num);
        let heights = StackHeights::for_capacity(self.stacksize, &wide);
        encode_rodata(&mut record, artifact.handler_vpcs(), artifact.handler_pcs(), &heights)?;

        let written = open
            .file
            .seek(SeekFrom::Start(self.append_at))
            .and_then(|_| open.file.write_all(&record))
            .and_then(|_| open.file.flush());
        match written {
            Ok(()) => {
                open.file.set_len(self.append_at + record.len() as u64)?;
                log::debug!(
                    "stored {} byte record at offset {} of {}",
                    record.len(),
                    self.append_at,
                    open.path.display()
                );
                Ok(())
            }
            Err(e) => {
                open.file.set_len(0)?;
                Err(e.into())
            }
        }
    }
}

#[cfg(unix)]
fn lock_exclusive(file: &File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;

    loop {
        // SAFETY: the descriptor is owned by `file` and open.
        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;

    fn emit(code: &mut Vec<u8>, op: Opcode, arg: u8) {
        code.push(op.to_u8());
        code.push(arg);
    }

    fn unit_in(dir: &Path, name: &str, first_const: u8) -> CodeUnit {
        let source = dir.join("pkg").join("mod.py");
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        if !source.exists() {
            fs::write(&source, "x = 1\n").unwrap();
        }
        let mut code = Vec::new();
        emit(&mut code, Opcode::LoadConst, first_const);
        emit(&mut code, Opcode::ReturnValue, 0);
        let mut unit = CodeUnit::new(name, code, 0, 1);
        unit.filename = source.to_string_lossy().into_owned();
        unit.first_line = 4;
        unit
    }

    fn artifact_for(arena: &Arc<ExecMemoryArena>, tag: u8) -> CompiledArtifact {
        CompiledArtifact::new(arena, &[tag; 24], vec![1], vec![1], StackHeights::U8(vec![0, 1]), 1).unwrap()
    }

    #[test]
    fn test_cache_path_markers() {
        let root = Path::new("/cache");
        let mut unit = CodeUnit::new("f", vec![], 0, 0);
        unit.filename = "/src/./app/../lib/util.py".into();
        unit.first_line = 12;
        assert_eq!(cache_path(root, &unit), PathBuf::from("/cache/src/lib/util.py@12.kiln-310.bin"));

        unit.name = "<module>".into();
        assert_eq!(cache_path(root, &unit), PathBuf::from("/cache/src/lib/util.py@12~mod.kiln-310.bin"));

        unit.name = "<lambda>".into();
        assert_eq!(cache_path(root, &unit), PathBuf::from("/cache/src/lib/util.py@12~anno.kiln-310.bin"));
    }

    #[test]
    fn test_frozen_source_timestamp() {
        let mut unit = CodeUnit::new("f", vec![], 0, 0);
        unit.filename = "<frozen importlib._bootstrap>".into();
        assert_eq!(source_timestamp(&unit).unwrap(), FROZEN_TIMESTAMP);

        unit.filename = "/definitely/not/here.py".into();
        assert!(matches!(source_timestamp(&unit), Err(CacheError::NoSource(_))));
    }

    #[test]
    fn test_missing_source_disables_cache() {
        let dir = tempfile::tempdir().unwrap();
        let mut unit = CodeUnit::new("f", vec![100, 0, 83, 0], 0, 1);
        unit.filename = "/definitely/not/here.py".into();
        let mut cache = ArtifactCache::open(Some(dir.path()), &unit);
        assert!(!cache.is_enabled());

        let arena = ExecMemoryArena::new();
        assert!(cache.load(&arena).is_none());
        assert!(cache.store(&artifact_for(&arena, 1)).is_ok());
    }

    #[test]
    fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let unit = unit_in(dir.path(), "f", 0);
        let arena = ExecMemoryArena::new();
        let original = artifact_for(&arena, 0x90);

        {
            let mut cache = ArtifactCache::open(Some(&dir.path().join("cache")), &unit);
            assert!(cache.is_enabled());
            assert!(cache.load(&arena).is_none());
            cache.store(&original).unwrap();
        }

        let mut cache = ArtifactCache::open(Some(&dir.path().join("cache")), &unit);
        let loaded = cache.load(&arena).unwrap();
        assert!(loaded.same_content(&original));
        assert_eq!(loaded.calc_pc(1), Some(1));
    }

    #[test]
    fn test_changed_bytes_miss() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let arena = ExecMemoryArena::new();
        {
            let unit = unit_in(dir.path(), "f", 0);
            let mut cache = ArtifactCache::open(Some(&root), &unit);
            cache.store(&artifact_for(&arena, 1)).unwrap();
        }

        let changed = unit_in(dir.path(), "f", 1);
        let mut cache = ArtifactCache::open(Some(&root), &changed);
        assert!(cache.load(&arena).is_none());
    }

    #[test]
    fn test_anonymous_units_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let arena = ExecMemoryArena::new();
        let first = unit_in(dir.path(), "<lambda>", 0);
        let second = unit_in(dir.path(), "<lambda>", 1);

        for (unit, tag) in [(&first, 1u8), (&second, 2u8)] {
            let mut cache = ArtifactCache::open(Some(&root), unit);
            assert!(cache.load(&arena).is_none());
            cache.store(&artifact_for(&arena, tag)).unwrap();
        }

        let path = cache_path(&root, &first);
        let records = super::super::format::scan_records(&fs::read(&path).unwrap(), true);
        assert_eq!(records.len(), 2);

        let mut cache = ArtifactCache::open(Some(&root), &second);
        assert_eq!(cache.load(&arena).unwrap().code()[0], 2);
        let mut cache = ArtifactCache::open(Some(&root), &first);
        assert_eq!(cache.load(&arena).unwrap().code()[0], 1);
    }

    #[test]
    fn test_store_truncates_stale_tail() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let unit = unit_in(dir.path(), "f", 0);
        let path = cache_path(&root, &unit);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, vec![0xAB; 4096]).unwrap();

        let arena = ExecMemoryArena::new();
        let artifact = artifact_for(&arena, 3);
        let mut cache = ArtifactCache::open(Some(&root), &unit);
        assert!(cache.load(&arena).is_none());
        cache.store(&artifact).unwrap();
        drop(cache);

        let expected = RECORD_HEADER_SIZE + 24 + rodata_size(1, 2, 1);
        assert_eq!(fs::metadata(&path).unwrap().len() as usize, expected);
    }
}
