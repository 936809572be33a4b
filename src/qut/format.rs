//! The persisted form of an [`UnwindProgram`].
//!
//! All integers are little-endian.
//!
//! ```text
//! magic            [u8; 4] = "QUTB"
//! version          u16
//! arch             u8
//! pointer size     u8
//! path length      u16, followed by the path bytes
//! build id kind    u8 (1 = embedded, 2 = derived)
//! build id length  u8, followed by the build id bytes
//! file size        u64
//! entry count      u32
//! checksum         u32, CRC32 of every other byte of the file
//! entries          entry count times:
//!                    pc_start u64, pc_end u64, code length u16, code bytes
//! ```

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use gimli::{EndianSlice, LittleEndian, Reader};

use super::program::{ProgramBuilder, UnwindProgram};
use crate::arch::ArchKind;
use crate::error::CacheError;
use crate::identity::{BinaryIdentity, BuildId};

pub const MAGIC: [u8; 4] = *b"QUTB";
pub const VERSION: u16 = 1;

/// Serializes `program` into its persisted form.
pub fn serialize(program: &UnwindProgram) -> Vec<u8> {
    let identity = program.identity();
    let path = identity.path().as_os_str().as_encoded_bytes();
    let path = &path[..path.len().min(u16::MAX as usize)];

    let mut out = Vec::with_capacity(64 + program.len() * 20 + program.code_size());
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.push(program.arch().code());
    out.push(program.arch().pointer_size());
    out.extend_from_slice(&(path.len() as u16).to_le_bytes());
    out.extend_from_slice(path);
    out.push(identity.build_id().kind_code());
    match identity.build_id() {
        BuildId::Embedded(bytes) => {
            let bytes = &bytes[..bytes.len().min(u8::MAX as usize)];
            out.push(bytes.len() as u8);
            out.extend_from_slice(bytes);
        }
        BuildId::Derived(hash) => {
            out.push(8);
            out.extend_from_slice(&hash.to_le_bytes());
        }
    }
    out.extend_from_slice(&identity.file_size().to_le_bytes());
    out.extend_from_slice(&(program.len() as u32).to_le_bytes());
    let checksum_offset = out.len();
    out.extend_from_slice(&[0; 4]);
    for entry in program.entries() {
        out.extend_from_slice(&entry.pc_start.to_le_bytes());
        out.extend_from_slice(&entry.pc_end.to_le_bytes());
        out.extend_from_slice(&(entry.code.len() as u16).to_le_bytes());
        out.extend_from_slice(entry.code);
    }
    let checksum = checksum(&out, checksum_offset);
    out[checksum_offset..checksum_offset + 4].copy_from_slice(&checksum.to_le_bytes());
    out
}

/// Parses a persisted program. Any damage is reported as an error; nothing
/// is ever partially recovered.
pub fn deserialize(bytes: &[u8]) -> Result<UnwindProgram, CacheError> {
    let mut reader = EndianSlice::new(bytes, LittleEndian);
    let mut magic = [0; 4];
    reader
        .read_slice(&mut magic)
        .map_err(|_| CacheError::BadMagic)?;
    if magic != MAGIC {
        return Err(CacheError::BadMagic);
    }
    let version = reader.read_u16()?;
    if version != VERSION {
        return Err(CacheError::UnsupportedVersion(version));
    }
    let arch = reader.read_u8()?;
    let pointer_size = reader.read_u8()?;
    let path_len = reader.read_u16()?;
    let path = reader.split(usize::from(path_len))?;
    let build_id_kind = reader.read_u8()?;
    let build_id_len = reader.read_u8()?;
    let build_id = reader.split(usize::from(build_id_len))?;
    let file_size = reader.read_u64()?;
    let entry_count = reader.read_u32()?;
    let checksum_offset = bytes.len() - reader.len();
    let expected = reader.read_u32()?;
    let computed = checksum(bytes, checksum_offset);
    if expected != computed {
        return Err(CacheError::ChecksumMismatch { expected, computed });
    }

    let arch = ArchKind::from_code(arch).ok_or(CacheError::ArchitectureMismatch)?;
    if arch.pointer_size() != pointer_size {
        return Err(CacheError::ArchitectureMismatch);
    }
    let build_id = match build_id_kind {
        1 => BuildId::Embedded(build_id.slice().to_vec()),
        2 => {
            let hash: [u8; 8] = build_id
                .slice()
                .try_into()
                .map_err(|_| CacheError::IdentityMismatch)?;
            BuildId::Derived(u64::from_le_bytes(hash))
        }
        _ => return Err(CacheError::IdentityMismatch),
    };
    let path = PathBuf::from(OsStr::from_bytes(path.slice()));
    let identity = BinaryIdentity::new(path, build_id, file_size);

    let mut builder = ProgramBuilder::new();
    let mut previous_end = 0;
    for _ in 0..entry_count {
        let pc_start = reader.read_u64()?;
        let pc_end = reader.read_u64()?;
        let code_len = reader.read_u16()?;
        let code = reader.split(usize::from(code_len))?;
        if pc_start >= pc_end || pc_start < previous_end {
            return Err(CacheError::UnsortedEntries);
        }
        previous_end = pc_end;
        builder.push(pc_start..pc_end, code.slice());
    }
    if !reader.is_empty() {
        return Err(CacheError::Malformed(gimli::Error::UnexpectedEof(
            gimli::ReaderOffsetId(bytes.len() as u64),
        )));
    }
    Ok(builder.finish(identity, arch))
}

fn checksum(bytes: &[u8], checksum_offset: usize) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&bytes[..checksum_offset]);
    hasher.update(&bytes[(checksum_offset + 4).min(bytes.len())..]);
    hasher.finalize()
}
