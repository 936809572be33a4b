use std::sync::Arc;

use fallible_iterator::FallibleIterator;

use crate::arch::ArchKind;
use crate::qut::instruction::{Instructions, INSTRUCTION_KIND_COUNT};

/// What a statistics callback is being told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticEvent {
    /// Number of emitted instructions of the named kind.
    Instruction(&'static str),
    /// Rows whose CFA rule could not be compiled.
    UnsupportedCfaRule,
    /// Rows with a register rule that needs the full DWARF evaluator.
    UnsupportedRegisterRule,
    /// EHABI opcodes that could not be translated.
    UnsupportedEhabiOpcode,
    /// Frame descriptors that could not be parsed.
    MalformedFde,
    /// Entries in the finished program.
    Entries,
}

/// An optional callback for tuning the compiler offline. It is only invoked
/// after a compile and has no influence on unwinding.
pub type StatisticsHook = Arc<dyn Fn(StatisticEvent, u64) + Send + Sync>;

const INSTRUCTION_NAMES: [&str; INSTRUCTION_KIND_COUNT] = [
    "cfa_register_offset",
    "cfa_expression",
    "same_value",
    "undefined",
    "saved_at",
    "val_cfa_offset",
    "constant",
    "in_register",
    "unsupported",
    "end",
];

/// Counters collected while compiling one image.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompileStatistics {
    pub instructions: [u64; INSTRUCTION_KIND_COUNT],
    pub unsupported_cfa_rules: u64,
    pub unsupported_register_rules: u64,
    pub unsupported_ehabi_opcodes: u64,
    pub malformed_fdes: u64,
    pub entries: u64,
}

impl CompileStatistics {
    pub(crate) fn record_code(&mut self, code: &[u8], arch: ArchKind) {
        let mut instructions = Instructions::new(code, arch);
        while let Ok(Some(instruction)) = instructions.next() {
            self.instructions[instruction.kind_index()] += 1;
        }
    }

    pub fn report(&self, hook: &StatisticsHook) {
        for (name, count) in INSTRUCTION_NAMES.iter().zip(self.instructions) {
            if count != 0 {
                hook(StatisticEvent::Instruction(name), count);
            }
        }
        let totals = [
            (StatisticEvent::UnsupportedCfaRule, self.unsupported_cfa_rules),
            (StatisticEvent::UnsupportedRegisterRule, self.unsupported_register_rules),
            (StatisticEvent::UnsupportedEhabiOpcode, self.unsupported_ehabi_opcodes),
            (StatisticEvent::MalformedFde, self.malformed_fdes),
        ];
        for (event, count) in totals {
            if count != 0 {
                hook(event, count);
            }
        }
        hook(StatisticEvent::Entries, self.entries);
    }
}
