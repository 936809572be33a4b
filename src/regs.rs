use std::fmt::Debug;

use crate::display_utils::HexNum;

/// The number of register slots in a [`RegisterSnapshot`]. This covers the
/// general purpose register file of every supported architecture, indexed by
/// DWARF register number.
pub const MAX_REGISTERS: usize = 32;

/// The register state of one frame.
///
/// This is a plain fixed-size value with no heap-held fields, so it can live
/// on the stack of a signal handler. Registers are indexed by their DWARF
/// register number; a register whose value is not known is simply absent.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RegisterSnapshot {
    pc: u64,
    values: [u64; MAX_REGISTERS],
    valid: u32,
}

impl RegisterSnapshot {
    /// Creates a snapshot in which only the program counter is known.
    pub fn new(pc: u64) -> Self {
        Self {
            pc,
            values: [0; MAX_REGISTERS],
            valid: 0,
        }
    }

    /// Builder-style variant of [`RegisterSnapshot::set`].
    pub fn with(mut self, register: u16, value: u64) -> Self {
        self.set(register, value);
        self
    }

    #[inline(always)]
    pub fn pc(&self) -> u64 {
        self.pc
    }

    #[inline(always)]
    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    #[inline(always)]
    pub fn get(&self, register: u16) -> Option<u64> {
        let index = usize::from(register);
        if index < MAX_REGISTERS && self.valid & (1 << index) != 0 {
            Some(self.values[index])
        } else {
            None
        }
    }

    /// Sets a register. Registers outside the snapshot's range are ignored.
    #[inline(always)]
    pub fn set(&mut self, register: u16, value: u64) {
        let index = usize::from(register);
        if index < MAX_REGISTERS {
            self.values[index] = value;
            self.valid |= 1 << index;
        }
    }

    /// Marks a register as unknown.
    #[inline(always)]
    pub fn clear(&mut self, register: u16) {
        let index = usize::from(register);
        if index < MAX_REGISTERS {
            self.valid &= !(1 << index);
        }
    }

    /// Iterates over the known registers in ascending register order.
    pub fn iter(&self) -> impl Iterator<Item = (u16, u64)> + '_ {
        (0..MAX_REGISTERS as u16).filter_map(move |r| self.get(r).map(|v| (r, v)))
    }
}

impl Default for RegisterSnapshot {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Debug for RegisterSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("RegisterSnapshot");
        s.field("pc", &HexNum(self.pc));
        for (register, value) in self.iter() {
            s.field(REGISTER_NAMES[usize::from(register)], &HexNum(value));
        }
        s.finish()
    }
}

const REGISTER_NAMES: [&str; MAX_REGISTERS] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13", "r14",
    "r15", "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23", "r24", "r25", "r26", "r27",
    "r28", "r29", "r30", "r31",
];
