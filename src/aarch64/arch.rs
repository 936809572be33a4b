use super::framepointer;
use super::reg;
use crate::arch::{Arch, ArchKind};
use crate::error::StepError;
use crate::memory::MemorySource;
use crate::regs::RegisterSnapshot;

/// With pointer authentication, the highest bits of a return address hold a
/// signature. They need to be stripped before the address can be used as a
/// code address. User space addresses fit in 40 bits.
const PTR_MASK: u64 = (1 << 40) - 1;

pub fn strip_ptr_auth(ptr: u64) -> u64 {
    ptr & PTR_MASK
}

pub struct ArchAarch64;

impl Arch for ArchAarch64 {
    const KIND: ArchKind = ArchKind::Aarch64;
    const SP: u16 = reg::SP;
    const FP: u16 = reg::FP;
    const RA: u16 = reg::LR;

    fn sanitize_return_address(address: u64) -> u64 {
        strip_ptr_auth(address)
    }

    fn unwind_frame_pointer(
        regs: &RegisterSnapshot,
        memory: &MemorySource,
    ) -> Result<Option<RegisterSnapshot>, StepError> {
        framepointer::unwind(regs, memory)
    }
}
