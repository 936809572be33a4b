use super::arch::strip_ptr_auth;
use super::reg;
use crate::error::StepError;
use crate::memory::MemorySource;
use crate::regs::RegisterSnapshot;

// Frame-based aarch64 functions store the caller's fp and lr on the stack and
// then set fp to the address where the caller's fp is stored.
//
// Function prologue example (this one also stores x19, x20, x21 and x22):
// stp  x22, x21, [sp, #-0x30]! ; subtracts 0x30 from sp, and then stores (x22, x21) at sp
// stp  x20, x19, [sp, #0x10]   ; stores (x20, x19) at sp + 0x10 (== original sp - 0x20)
// stp  fp, lr, [sp, #0x20]     ; stores (fp, lr) at sp + 0x20 (== original sp - 0x10)
// add  fp, sp, #0x20           ; sets fp to the address where the old fp is stored on the stack
//
// which leaves
//
//       [more saved regs]  [caller's frame pointer]  [return address]  [... rest of the stack]
//       ^ sp               ^ fp
//
// So: *fp is the caller's frame pointer, *(fp + 8) is the return address, and
// the caller's sp is fp + 16.
pub(crate) fn unwind(
    regs: &RegisterSnapshot,
    memory: &MemorySource,
) -> Result<Option<RegisterSnapshot>, StepError> {
    let sp = regs.get(reg::SP).ok_or(StepError::RegisterUnavailable(reg::SP))?;
    let fp = regs.get(reg::FP).ok_or(StepError::RegisterUnavailable(reg::FP))?;
    if fp == 0 {
        return Ok(None);
    }
    let new_sp = fp.checked_add(16).ok_or(StepError::IntegerOverflow)?;
    if new_sp <= sp {
        return Err(StepError::FramePointerMovedBackwards);
    }
    let new_fp = memory.read_u64(fp)?;
    let new_lr = strip_ptr_auth(memory.read_u64(fp + 8)?);
    if new_lr == 0 {
        return Ok(None);
    }
    Ok(Some(
        RegisterSnapshot::new(new_lr)
            .with(reg::SP, new_sp)
            .with(reg::FP, new_fp)
            .with(reg::LR, new_lr),
    ))
}
