use libc::ucontext_t;

use super::reg;
use crate::regs::RegisterSnapshot;

impl RegisterSnapshot {
    /// The registers saved in the context a signal handler receives.
    pub fn from_ucontext(context: &ucontext_t) -> Self {
        let mcontext = &context.uc_mcontext;
        let mut regs = RegisterSnapshot::new(mcontext.pc).with(reg::SP, mcontext.sp);
        // x0 to x30 are DWARF registers 0 to 30.
        for (register, value) in mcontext.regs.iter().enumerate() {
            regs.set(register as u16, *value);
        }
        regs
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_from_ucontext() {
        // SAFETY: ucontext_t is plain data.
        let mut context: ucontext_t = unsafe { std::mem::zeroed() };
        context.uc_mcontext.pc = 0x40_1234;
        context.uc_mcontext.sp = 0x7ffc_0000;
        context.uc_mcontext.regs[29] = 0x7ffc_0040;
        context.uc_mcontext.regs[30] = 0x40_5678;
        let regs = RegisterSnapshot::from_ucontext(&context);
        assert_eq!(regs.pc(), 0x40_1234);
        assert_eq!(regs.get(reg::SP), Some(0x7ffc_0000));
        assert_eq!(regs.get(reg::FP), Some(0x7ffc_0040));
        assert_eq!(regs.get(reg::LR), Some(0x40_5678));
    }
}
