use std::collections::HashSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::arch::ArchKind;
use crate::error::CacheError;
use crate::identity::BinaryIdentity;
use crate::qut::format::{deserialize, serialize};
use crate::qut::UnwindProgram;

const EXTENSION: &str = "qut";
const TEMP_MARKER: &str = "_temp_";
const MALFORMED_MARKER: &str = "_malformed_";

/// Persisted unwind programs, one file per binary identity.
///
/// Files are named `<soname>.<build id>.qut`. Writes go to a temporary file
/// that is renamed into place, so a crash never leaves a half-written file
/// under the final name. A file that fails validation is renamed aside and
/// never read again.
pub struct DiskStore {
    dir: PathBuf,
    arch: ArchKind,
    max_age: Duration,
    evictable: Mutex<HashSet<PathBuf>>,
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_owned(),
        source,
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

impl DiskStore {
    pub fn new(dir: impl Into<PathBuf>, arch: ArchKind, max_age: Duration) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_error(&dir))?;
        Ok(Self {
            dir,
            arch,
            max_age,
            evictable: Mutex::new(HashSet::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The file a program for `identity` is stored in.
    pub fn path_for(&self, identity: &BinaryIdentity) -> PathBuf {
        self.dir.join(format!(
            "{}.{}.{EXTENSION}",
            identity.soname(),
            identity.build_id()
        ))
    }

    /// Loads the program for `identity`. `Ok(None)` if no file exists; an
    /// error if a file exists but cannot be used, in which case the file has
    /// been moved aside.
    pub fn load(&self, identity: &BinaryIdentity) -> Result<Option<UnwindProgram>, CacheError> {
        let path = self.path_for(identity);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };
        // SAFETY: Files in the cache directory are only ever replaced by
        // renaming, never modified in place, so the mapping stays valid.
        let mmap = unsafe { memmap2::Mmap::map(&file) }.map_err(io_error(&path))?;
        let program = deserialize(&mmap).and_then(|program| {
            if program.arch() != self.arch {
                Err(CacheError::ArchitectureMismatch)
            } else if program.identity() != identity {
                Err(CacheError::IdentityMismatch)
            } else {
                Ok(program)
            }
        });
        match program {
            Ok(program) => {
                // Keep files in use from being garbage collected.
                if let Err(e) = file.set_modified(SystemTime::now()) {
                    tracing::trace!("Could not touch {}: {e}", path.display());
                }
                tracing::debug!("Loaded {} entries from {}", program.len(), path.display());
                Ok(Some(program))
            }
            Err(e) => {
                drop(mmap);
                self.reject(&path, &e);
                Err(e)
            }
        }
    }

    /// Persists `program`, replacing any existing file for its identity.
    pub fn store(&self, program: &UnwindProgram) -> Result<(), CacheError> {
        let path = self.path_for(program.identity());
        let temp_path = with_suffix(&path, &format!("{TEMP_MARKER}{}", std::process::id()));
        let bytes = serialize(program);
        let written = File::create(&temp_path).and_then(|mut file| {
            file.write_all(&bytes)?;
            file.sync_all()
        });
        if let Err(e) = written {
            let _ = fs::remove_file(&temp_path);
            return Err(io_error(&temp_path)(e));
        }
        fs::rename(&temp_path, &path).map_err(io_error(&path))?;
        self.evictable.lock().remove(&path);
        tracing::debug!("Stored {} entries to {}", program.len(), path.display());
        Ok(())
    }

    /// Marks the file for `identity` as no longer needed. It is deleted by
    /// the next garbage collection.
    pub fn mark_evictable(&self, identity: &BinaryIdentity) {
        self.evictable.lock().insert(self.path_for(identity));
    }

    /// Deletes leftover temporary and rejected files, files that have not
    /// been used for longer than the maximum age, and evictable files.
    /// Returns the number of deleted files.
    pub fn collect_garbage(&self) -> Result<usize, CacheError> {
        let own_temp_suffix = format!("{TEMP_MARKER}{}", std::process::id());
        let evictable = std::mem::take(&mut *self.evictable.lock());
        let now = SystemTime::now();
        let mut removed = 0;
        for entry in fs::read_dir(&self.dir).map_err(io_error(&self.dir))? {
            let entry = entry.map_err(io_error(&self.dir))?;
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let is_leftover = (name.contains(TEMP_MARKER) && !name.ends_with(&own_temp_suffix))
                || name.contains(MALFORMED_MARKER);
            let is_program = name.ends_with(&format!(".{EXTENSION}"));
            let is_expired = is_program
                && entry
                    .metadata()
                    .and_then(|metadata| metadata.modified())
                    .ok()
                    .and_then(|mtime| now.duration_since(mtime).ok())
                    .map_or(false, |age| age > self.max_age);
            if is_leftover || is_expired || (is_program && evictable.contains(&path)) {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => tracing::warn!("Could not remove {}: {e}", path.display()),
                }
            }
        }
        tracing::info!("Garbage collection removed {removed} files from {}", self.dir.display());
        Ok(removed)
    }

    fn reject(&self, path: &Path, error: &CacheError) {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let rejected = with_suffix(path, &format!("{MALFORMED_MARKER}{secs}"));
        tracing::warn!("Rejecting {}: {error}", path.display());
        if let Err(e) = fs::rename(path, &rejected) {
            tracing::warn!("Could not move {} aside: {e}", path.display());
            let _ = fs::remove_file(path);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::identity::BuildId;
    use crate::qut::ProgramBuilder;

    fn identity() -> BinaryIdentity {
        BinaryIdentity::new("/system/lib64/libstore.so", BuildId::Embedded(vec![0xca, 0xfe]), 99)
    }

    fn program() -> UnwindProgram {
        let mut builder = ProgramBuilder::new();
        builder.push(0x100..0x180, &[0x01, 0x41, 0xff]);
        builder.finish(identity(), ArchKind::X86_64)
    }

    fn store(dir: &Path) -> DiskStore {
        DiskStore::new(dir, ArchKind::X86_64, Duration::from_secs(3600)).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store.load(&identity()).unwrap().is_none());
        store.store(&program()).unwrap();
        assert_eq!(
            store.path_for(&identity()).file_name().unwrap(),
            "libstore.so.cafe.qut"
        );
        let loaded = store.load(&identity()).unwrap().unwrap();
        similar_asserts::assert_eq!(
            loaded.entries().collect::<Vec<_>>(),
            program().entries().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_corrupted_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.store(&program()).unwrap();
        let path = store.path_for(&identity());
        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        fs::write(&path, bytes).unwrap();

        assert!(matches!(
            store.load(&identity()),
            Err(CacheError::ChecksumMismatch { .. })
        ));
        assert!(!path.exists());
        // The next lookup is a plain miss.
        assert!(store.load(&identity()).unwrap().is_none());
        // The rejected file is removed by garbage collection.
        assert_eq!(store.collect_garbage().unwrap(), 1);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_identity_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.store(&program()).unwrap();
        // Same file name, different file size.
        let other = BinaryIdentity::new("/vendor/lib64/libstore.so", BuildId::Embedded(vec![0xca, 0xfe]), 99);
        assert_eq!(store.path_for(&other), store.path_for(&identity()));
        assert!(matches!(store.load(&other), Err(CacheError::IdentityMismatch)));
    }

    #[test]
    fn test_architecture_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        store(dir.path()).store(&program()).unwrap();
        let arm_store = DiskStore::new(dir.path(), ArchKind::Aarch64, Duration::from_secs(3600)).unwrap();
        assert!(matches!(
            arm_store.load(&identity()),
            Err(CacheError::ArchitectureMismatch)
        ));
    }

    #[test]
    fn test_garbage_collection() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.store(&program()).unwrap();
        fs::write(dir.path().join("libx.so.00.qut_temp_1"), b"partial").unwrap();
        assert_eq!(store.collect_garbage().unwrap(), 1);
        assert!(store.path_for(&identity()).exists());

        store.mark_evictable(&identity());
        assert_eq!(store.collect_garbage().unwrap(), 1);
        assert!(!store.path_for(&identity()).exists());

        let expiring = DiskStore::new(dir.path(), ArchKind::X86_64, Duration::ZERO).unwrap();
        expiring.store(&program()).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(expiring.collect_garbage().unwrap(), 1);
    }
}
