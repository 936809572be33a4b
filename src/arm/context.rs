use libc::ucontext_t;

use super::reg;
use crate::regs::RegisterSnapshot;

impl RegisterSnapshot {
    /// The registers saved in the context a signal handler receives.
    pub fn from_ucontext(context: &ucontext_t) -> Self {
        let m = &context.uc_mcontext;
        let values = [
            m.arm_r0, m.arm_r1, m.arm_r2, m.arm_r3, m.arm_r4, m.arm_r5, m.arm_r6, m.arm_r7,
            m.arm_r8, m.arm_r9, m.arm_r10, m.arm_fp, m.arm_ip, m.arm_sp, m.arm_lr,
        ];
        let mut regs = RegisterSnapshot::new(u64::from(m.arm_pc));
        for (register, value) in values.iter().enumerate() {
            regs.set(register as u16, u64::from(*value));
        }
        regs.set(reg::PC, u64::from(m.arm_pc));
        regs
    }
}
