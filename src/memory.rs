use std::sync::Arc;

use crate::error::MemoryError;

/// Where memory of the unwound process comes from.
///
/// Every parser and the interpreter read one field at a time through this
/// type, so a failed read only aborts the current step.
#[derive(Clone, Debug)]
pub enum MemorySource {
    /// The current process. Reads go through `process_vm_readv` on our own
    /// pid, which reports unmapped pages as `EFAULT` instead of faulting, and
    /// which is async-signal-safe.
    Local(LocalMemory),
    /// Another process, read in bounded chunks.
    Remote(RemoteMemory),
    /// A copy of a memory range, for example a stack captured with a sample.
    Captured(CapturedMemory),
}

#[derive(Clone, Debug)]
pub struct LocalMemory {
    pid: libc::pid_t,
}

#[derive(Clone, Debug)]
pub struct RemoteMemory {
    pid: libc::pid_t,
    chunk_size: usize,
}

#[derive(Clone)]
pub struct CapturedMemory {
    base: u64,
    bytes: Arc<[u8]>,
}

impl std::fmt::Debug for CapturedMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedMemory")
            .field("base", &crate::display_utils::HexNum(self.base))
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl MemorySource {
    pub fn local() -> Self {
        // SAFETY: getpid has no preconditions.
        let pid = unsafe { libc::getpid() };
        MemorySource::Local(LocalMemory { pid })
    }

    pub fn remote(pid: i32, chunk_size: usize) -> Self {
        MemorySource::Remote(RemoteMemory {
            pid,
            chunk_size: chunk_size.max(8),
        })
    }

    pub fn captured(base: u64, bytes: impl Into<Arc<[u8]>>) -> Self {
        MemorySource::Captured(CapturedMemory {
            base,
            bytes: bytes.into(),
        })
    }

    /// Fills `buf` with the bytes at `address`.
    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        match self {
            MemorySource::Local(local) => {
                let read = process_vm_read(local.pid, address, buf)?;
                if read < buf.len() {
                    // The read stopped at the first unmapped page.
                    return Err(MemoryError::Invalid(address + read as u64));
                }
                Ok(())
            }
            MemorySource::Remote(remote) => remote.read(address, buf),
            MemorySource::Captured(captured) => captured.read(address, buf),
        }
    }

    pub fn read_u32(&self, address: u64) -> Result<u32, MemoryError> {
        let mut buf = [0; 4];
        self.read(address, &mut buf)?;
        Ok(u32::from_ne_bytes(buf))
    }

    pub fn read_u64(&self, address: u64) -> Result<u64, MemoryError> {
        let mut buf = [0; 8];
        self.read(address, &mut buf)?;
        Ok(u64::from_ne_bytes(buf))
    }

    /// Reads a pointer-sized value, zero-extended to 64 bits.
    pub fn read_pointer(&self, address: u64, pointer_size: u8) -> Result<u64, MemoryError> {
        match pointer_size {
            4 => self.read_u32(address).map(u64::from),
            _ => self.read_u64(address),
        }
    }

    /// Reads `size` bytes (at most 8) as an unsigned integer. Used by DWARF
    /// expression evaluation.
    pub fn read_sized(&self, address: u64, size: u8) -> Result<u64, MemoryError> {
        let size = usize::from(size.clamp(1, 8));
        let mut buf = [0; 8];
        self.read(address, &mut buf[..size])?;
        Ok(u64::from_le_bytes(buf))
    }
}

impl RemoteMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let mut done = 0;
        for chunk in buf.chunks_mut(self.chunk_size) {
            let chunk_address = address
                .checked_add(done as u64)
                .ok_or(MemoryError::IntegerOverflow)?;
            let len = chunk.len();
            let mut filled = 0;
            let mut retried = false;
            while filled < len {
                let read = process_vm_read(self.pid, chunk_address + filled as u64, &mut chunk[filled..])?;
                filled += read;
                if filled < len {
                    if retried || read == 0 {
                        return Err(MemoryError::Partial {
                            address: chunk_address,
                            len,
                            read: filled,
                        });
                    }
                    retried = true;
                }
            }
            done += len;
        }
        Ok(())
    }
}

impl CapturedMemory {
    fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryError> {
        let start = address
            .checked_sub(self.base)
            .ok_or(MemoryError::Invalid(address))?;
        let start = usize::try_from(start).map_err(|_| MemoryError::Invalid(address))?;
        let end = start
            .checked_add(buf.len())
            .ok_or(MemoryError::IntegerOverflow)?;
        let bytes = self
            .bytes
            .get(start..end)
            .ok_or(MemoryError::Invalid(address))?;
        buf.copy_from_slice(bytes);
        Ok(())
    }
}

fn process_vm_read(pid: libc::pid_t, address: u64, buf: &mut [u8]) -> Result<usize, MemoryError> {
    if buf.is_empty() {
        return Ok(0);
    }
    let local = libc::iovec {
        iov_base: buf.as_mut_ptr().cast(),
        iov_len: buf.len(),
    };
    let remote = libc::iovec {
        iov_base: address as usize as *mut libc::c_void,
        iov_len: buf.len(),
    };
    // SAFETY: `local` describes exactly the writable buffer `buf`. The kernel
    // validates the remote range and reports unmapped pages as EFAULT.
    let read = unsafe { libc::process_vm_readv(pid, &local, 1, &remote, 1, 0) };
    if read < 0 {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        return Err(if errno == libc::EFAULT {
            MemoryError::Invalid(address)
        } else {
            MemoryError::Os { address, errno }
        });
    }
    Ok(read as usize)
}
