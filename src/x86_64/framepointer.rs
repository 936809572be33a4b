use super::reg;
use crate::error::StepError;
use crate::memory::MemorySource;
use crate::regs::RegisterSnapshot;

// Do a frame pointer stack walk. Code that is compiled with frame pointers
// has the following function prologues and epilogues:
//
// Function prologue:
// pushq  %rbp
// movq   %rsp, %rbp
//
// Function epilogue:
// popq   %rbp
// ret
//
// callq pushes the return address onto the stack, so once the prologue has
// run we have the following stack layout:
//
//       [... more stack]  [caller's frame pointer]  [return address]  [... rest of the stack]
//       ^ rsp             ^ rbp
//
// So: *rbp is the caller's frame pointer, *(rbp + 8) is the return address,
// and the caller's rsp is rbp + 16.
pub(crate) fn unwind(
    regs: &RegisterSnapshot,
    memory: &MemorySource,
) -> Result<Option<RegisterSnapshot>, StepError> {
    let sp = regs.get(reg::RSP).ok_or(StepError::RegisterUnavailable(reg::RSP))?;
    let bp = regs.get(reg::RBP).ok_or(StepError::RegisterUnavailable(reg::RBP))?;
    if bp == 0 {
        return Ok(None);
    }
    let new_sp = bp.checked_add(16).ok_or(StepError::IntegerOverflow)?;
    if new_sp <= sp {
        return Err(StepError::FramePointerMovedBackwards);
    }
    // The caller may use rbp as a general purpose register, so new_bp is not
    // checked here.
    let new_bp = memory.read_u64(bp)?;
    let return_address = memory.read_u64(bp + 8)?;
    if return_address == 0 {
        return Ok(None);
    }
    Ok(Some(
        RegisterSnapshot::new(return_address)
            .with(reg::RSP, new_sp)
            .with(reg::RBP, new_bp),
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    fn stack(base: u64, words: &[u64]) -> MemorySource {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        MemorySource::captured(base, bytes)
    }

    #[test]
    fn test_follow_chain() {
        // 0x1000: [locals] [bp=0x1020] [ra=0x401234] [locals] [bp=0] [ra=0x405678]
        let memory = stack(0x1000, &[0, 0x1020, 0x401234, 0, 0, 0, 0, 0]);
        let regs = RegisterSnapshot::new(0x400100)
            .with(reg::RSP, 0x1000)
            .with(reg::RBP, 0x1008);
        let caller = unwind(&regs, &memory).unwrap().unwrap();
        assert_eq!(caller.pc(), 0x401234);
        assert_eq!(caller.get(reg::RSP), Some(0x1018));
        assert_eq!(caller.get(reg::RBP), Some(0x1020));
    }

    #[test]
    fn test_end_of_chain() {
        let memory = stack(0x1000, &[0, 0, 0, 0]);
        let regs = RegisterSnapshot::new(0x400100)
            .with(reg::RSP, 0x1000)
            .with(reg::RBP, 0);
        assert_eq!(unwind(&regs, &memory), Ok(None));
        // A zero return address also ends the chain.
        let regs = regs.with(reg::RBP, 0x1000);
        assert_eq!(unwind(&regs, &memory), Ok(None));
    }

    #[test]
    fn test_moving_backwards_is_an_error() {
        let memory = stack(0x1000, &[0; 8]);
        let regs = RegisterSnapshot::new(0x400100)
            .with(reg::RSP, 0x1030)
            .with(reg::RBP, 0x1008);
        assert_eq!(
            unwind(&regs, &memory),
            Err(StepError::FramePointerMovedBackwards)
        );
    }

    #[test]
    fn test_unreadable_frame() {
        let memory = stack(0x1000, &[0; 2]);
        let regs = RegisterSnapshot::new(0x400100)
            .with(reg::RSP, 0x1000)
            .with(reg::RBP, 0x5000);
        assert_eq!(unwind(&regs, &memory), Err(StepError::MemoryFault(0x5000)));
    }
}
