use std::path::PathBuf;

/// A failed read from the target address space.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Address 0x{0:x} is not mapped in the target")]
    Invalid(u64),

    #[error("Read of {len} bytes at 0x{address:x} only returned {read} bytes")]
    Partial { address: u64, len: usize, read: usize },

    #[error("Reading memory of the target failed with errno {errno} at 0x{address:x}")]
    Os { address: u64, errno: i32 },

    #[error("Address computation overflowed")]
    IntegerOverflow,
}

impl MemoryError {
    /// The address this error refers to, if any.
    pub fn address(&self) -> Option<u64> {
        match self {
            MemoryError::Invalid(address)
            | MemoryError::Partial { address, .. }
            | MemoryError::Os { address, .. } => Some(*address),
            MemoryError::IntegerOverflow => None,
        }
    }
}

/// The reason a single unwind step failed. Every variant maps to a
/// transition in the fallback chain and never aborts the walk on its own.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepError {
    #[error("No unwind information covers the address")]
    NoCoverage,

    #[error("Could not read memory at 0x{0:x}")]
    MemoryFault(u64),

    #[error("The unwind rule for this address needs the full DWARF evaluator")]
    Unsupported,

    #[error("No compiled program is cached for this image yet")]
    NotCached,

    #[error("Register {0} is needed but its value is unknown")]
    RegisterUnavailable(u16),

    #[error("The compiled program is malformed")]
    MalformedProgram,

    #[error("Frame pointer unwinding moved backwards")]
    FramePointerMovedBackwards,

    #[error("Unwinding caused integer overflow")]
    IntegerOverflow,

    #[error("DWARF evaluation failed: {0}")]
    Dwarf(#[from] gimli::Error),
}

impl From<MemoryError> for StepError {
    fn from(e: MemoryError) -> Self {
        match e.address() {
            Some(address) => StepError::MemoryFault(address),
            None => StepError::IntegerOverflow,
        }
    }
}

/// An error that prevents an image from being compiled at all. Problems in
/// individual functions are not reported here; they downgrade the affected
/// range to the "unsupported" sentinel instead.
#[derive(thiserror::Error, Debug)]
pub enum CompileError {
    #[error("Could not parse the image: {0}")]
    Object(#[from] object::Error),

    #[error("The image architecture {found:?} does not match the unwinder architecture {expected:?}")]
    ArchitectureMismatch {
        expected: crate::ArchKind,
        found: Option<crate::ArchKind>,
    },

    #[error("Big-endian images are not supported")]
    BigEndian,

    #[error("Unsupported image architecture {0:?}")]
    UnsupportedArchitecture(object::Architecture),
}

/// A problem with the persisted program store. These are always treated as a
/// cache miss by the callers.
#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Bad magic in persisted program")]
    BadMagic,

    #[error("Unsupported format version {0}")]
    UnsupportedVersion(u16),

    #[error("Checksum mismatch: expected 0x{expected:08x}, computed 0x{computed:08x}")]
    ChecksumMismatch { expected: u32, computed: u32 },

    #[error("The persisted program was built for another image")]
    IdentityMismatch,

    #[error("The persisted program was built for another architecture")]
    ArchitectureMismatch,

    #[error("The persisted program is truncated or malformed: {0}")]
    Malformed(#[from] gimli::Error),

    #[error("The persisted entry table is not sorted or has overlapping entries")]
    UnsortedEntries,
}

/// Failure to build a maps snapshot.
#[derive(thiserror::Error, Debug)]
pub enum MapsError {
    #[error("Could not read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed maps line {line}: {reason}")]
    Format { line: usize, reason: &'static str },
}
