use super::framepointer;
use super::reg;
use crate::arch::{Arch, ArchKind};
use crate::error::StepError;
use crate::memory::MemorySource;
use crate::regs::RegisterSnapshot;

pub struct ArchArm;

impl Arch for ArchArm {
    const KIND: ArchKind = ArchKind::Arm;
    const SP: u16 = reg::SP;
    const FP: u16 = reg::R7;
    const RA: u16 = reg::LR;

    /// Clears the Thumb bit.
    fn sanitize_return_address(address: u64) -> u64 {
        address & !1
    }

    fn unwind_frame_pointer(
        regs: &RegisterSnapshot,
        memory: &MemorySource,
    ) -> Result<Option<RegisterSnapshot>, StepError> {
        framepointer::unwind(regs, memory)
    }
}
