use super::reg;
use crate::error::StepError;
use crate::memory::MemorySource;
use crate::regs::RegisterSnapshot;

// Thumb code uses r7 as the frame pointer, ARM code uses r11. Both push the
// frame pointer and lr next to each other:
//
// push  {r7, lr}
// mov   r7, sp
//
//       [more saved regs]  [caller's frame pointer]  [return address]  [... rest of the stack]
//       ^ sp               ^ fp
//
// So: *fp is the caller's frame pointer, *(fp + 4) is the return address, and
// the caller's sp is fp + 8. We don't know whether the current function is
// Thumb or ARM code, so r7 is tried first and r11 only if r7 doesn't lead to a
// plausible caller frame.
pub(crate) fn unwind(
    regs: &RegisterSnapshot,
    memory: &MemorySource,
) -> Result<Option<RegisterSnapshot>, StepError> {
    let sp = regs.get(reg::SP).ok_or(StepError::RegisterUnavailable(reg::SP))?;
    match unwind_with(reg::R7, sp, regs, memory) {
        Ok(Some(caller)) => Ok(Some(caller)),
        thumb_result => match unwind_with(reg::R11, sp, regs, memory) {
            Ok(Some(caller)) => Ok(Some(caller)),
            _ => thumb_result,
        },
    }
}

fn unwind_with(
    fp_register: u16,
    sp: u64,
    regs: &RegisterSnapshot,
    memory: &MemorySource,
) -> Result<Option<RegisterSnapshot>, StepError> {
    let fp = regs
        .get(fp_register)
        .ok_or(StepError::RegisterUnavailable(fp_register))?;
    if fp == 0 {
        return Ok(None);
    }
    let new_sp = fp.checked_add(8).ok_or(StepError::IntegerOverflow)?;
    if new_sp <= sp || new_sp > u64::from(u32::MAX) {
        return Err(StepError::FramePointerMovedBackwards);
    }
    let new_fp = u64::from(memory.read_u32(fp)?);
    let new_lr = u64::from(memory.read_u32(fp + 4)?);
    if new_lr == 0 {
        return Ok(None);
    }
    Ok(Some(
        RegisterSnapshot::new(new_lr & !1)
            .with(reg::SP, new_sp)
            .with(fp_register, new_fp)
            .with(reg::LR, new_lr),
    ))
}
