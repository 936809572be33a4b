use super::framepointer;
use super::reg;
use crate::arch::{Arch, ArchKind};
use crate::error::StepError;
use crate::memory::MemorySource;
use crate::regs::RegisterSnapshot;

pub struct ArchX86_64;

impl Arch for ArchX86_64 {
    const KIND: ArchKind = ArchKind::X86_64;
    const SP: u16 = reg::RSP;
    const FP: u16 = reg::RBP;
    const RA: u16 = reg::RA;

    // The return address column doubles as rip, which PLT stubs use in their
    // CFA expressions.
    fn register_value(regs: &RegisterSnapshot, register: u16) -> Option<u64> {
        if register == reg::RA {
            Some(regs.pc())
        } else {
            regs.get(register)
        }
    }

    fn unwind_frame_pointer(
        regs: &RegisterSnapshot,
        memory: &MemorySource,
    ) -> Result<Option<RegisterSnapshot>, StepError> {
        framepointer::unwind(regs, memory)
    }
}
