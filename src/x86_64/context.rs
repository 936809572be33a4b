use libc::{c_int, ucontext_t};

use super::reg;
use crate::regs::RegisterSnapshot;

/// `gregs` indices in DWARF register order.
const GREGS: [c_int; 16] = [
    libc::REG_RAX,
    libc::REG_RDX,
    libc::REG_RCX,
    libc::REG_RBX,
    libc::REG_RSI,
    libc::REG_RDI,
    libc::REG_RBP,
    libc::REG_RSP,
    libc::REG_R8,
    libc::REG_R9,
    libc::REG_R10,
    libc::REG_R11,
    libc::REG_R12,
    libc::REG_R13,
    libc::REG_R14,
    libc::REG_R15,
];

impl RegisterSnapshot {
    /// The registers saved in the context a signal handler receives.
    pub fn from_ucontext(context: &ucontext_t) -> Self {
        let gregs = &context.uc_mcontext.gregs;
        let get = |index: c_int| gregs[index as usize] as u64;
        let mut regs = RegisterSnapshot::new(get(libc::REG_RIP));
        for (register, index) in GREGS.iter().enumerate() {
            regs.set(register as u16, get(*index));
        }
        regs
    }
}
