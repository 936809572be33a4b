use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use object::Object;

use crate::display_utils::HexBytes;

/// Identifies a specific build of a binary image.
///
/// The embedded GNU build id is the canonical identifier. Only images that
/// carry no build id fall back to a hash over path, size and modification time.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum BuildId {
    Embedded(Vec<u8>),
    Derived(u64),
}

impl BuildId {
    pub fn derived(path: &Path, file_size: u64, mtime: SystemTime) -> Self {
        let mut path_hasher = crc32fast::Hasher::new();
        path_hasher.update(path.as_os_str().as_encoded_bytes());
        let mut stat_hasher = crc32fast::Hasher::new();
        stat_hasher.update(&file_size.to_le_bytes());
        let since_epoch = mtime.duration_since(UNIX_EPOCH).unwrap_or_default();
        stat_hasher.update(&since_epoch.as_secs().to_le_bytes());
        stat_hasher.update(&since_epoch.subsec_nanos().to_le_bytes());
        BuildId::Derived(
            u64::from(path_hasher.finalize()) << 32 | u64::from(stat_hasher.finalize()),
        )
    }

    pub(crate) fn kind_code(&self) -> u8 {
        match self {
            BuildId::Embedded(_) => 1,
            BuildId::Derived(_) => 2,
        }
    }
}

impl Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildId::Embedded(bytes) => HexBytes(bytes).fmt(f),
            BuildId::Derived(hash) => write!(f, "{hash:016x}"),
        }
    }
}

/// The cache key for compiled unwind programs. Two images with the same
/// identity are assumed to carry identical unwind information.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BinaryIdentity {
    path: PathBuf,
    build_id: BuildId,
    file_size: u64,
}

impl BinaryIdentity {
    pub fn new(path: impl Into<PathBuf>, build_id: BuildId, file_size: u64) -> Self {
        Self {
            path: path.into(),
            build_id,
            file_size,
        }
    }

    /// Computes the identity of an image from its file contents and metadata.
    pub fn for_image_data(path: &Path, data: &[u8], mtime: SystemTime) -> Self {
        let file_size = data.len() as u64;
        let embedded = object::File::parse(data)
            .ok()
            .and_then(|file| file.build_id().ok().flatten())
            .filter(|id| !id.is_empty())
            .map(|id| BuildId::Embedded(id.to_vec()));
        let build_id = embedded.unwrap_or_else(|| BuildId::derived(path, file_size, mtime));
        Self::new(path, build_id, file_size)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// The file name of the image, e.g. `libc.so.6`.
    pub fn soname(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

impl Display for BinaryIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.path.display(), self.build_id)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_derived_build_id_depends_on_stat() {
        let path = Path::new("/system/lib64/libfoo.so");
        let t = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let a = BuildId::derived(path, 100, t);
        assert_eq!(a, BuildId::derived(path, 100, t));
        assert_ne!(a, BuildId::derived(path, 101, t));
        assert_ne!(a, BuildId::derived(path, 100, t + Duration::from_secs(1)));
        assert_ne!(a, BuildId::derived(Path::new("/system/lib/libfoo.so"), 100, t));
    }

    #[test]
    fn test_non_elf_data_gets_derived_id() {
        let id = BinaryIdentity::for_image_data(Path::new("/tmp/blob"), b"not an elf", UNIX_EPOCH);
        assert!(matches!(id.build_id(), BuildId::Derived(_)));
        assert_eq!(id.file_size(), 10);
        assert_eq!(id.soname(), "blob");
    }

    #[test]
    fn test_display() {
        let id = BinaryIdentity::new("/lib/libc.so.6", BuildId::Embedded(vec![0xab, 0x01]), 5);
        assert_eq!(id.build_id().to_string(), "ab01");
        assert_eq!(id.to_string(), "/lib/libc.so.6 (ab01)");
    }
}
