//! Executes compiled unwind programs.
//!
//! This is the signal-handler path: nothing in here allocates, locks or
//! logs. All scratch state lives in fixed-size arrays on the stack.

use fallible_iterator::FallibleIterator;
use gimli::{EndianSlice, LittleEndian};

use crate::arch::Arch;
use crate::dwarf::{evaluate, expression_encoding};
use crate::error::StepError;
use crate::memory::MemorySource;
use crate::qut::{Instruction, Instructions, UnwindProgram};
use crate::regs::{RegisterSnapshot, MAX_REGISTERS};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Rule {
    Unchanged,
    Undefined,
    SavedAt(i64),
    ValCfaOffset(i64),
    Constant(i64),
    InRegister(u16),
}

#[derive(Clone, Copy)]
enum Cfa<'a> {
    RegisterOffset(u16, i64),
    Expression(&'a [u8]),
}

/// Computes the caller's registers for the frame at `rel_pc`, which is
/// relative to the load bias of the program's image.
///
/// Returns `Ok(None)` if this frame is the outermost one, i.e. its return
/// address is undefined or zero.
pub fn step<A: Arch>(
    program: &UnwindProgram,
    rel_pc: u64,
    regs: &RegisterSnapshot,
    memory: &MemorySource,
) -> Result<Option<RegisterSnapshot>, StepError> {
    let entry = program.lookup(rel_pc).ok_or(StepError::NoCoverage)?;
    execute::<A>(entry.code, regs, memory)
}

/// Runs one entry's instructions against `regs`.
pub(crate) fn execute<A: Arch>(
    code: &[u8],
    regs: &RegisterSnapshot,
    memory: &MemorySource,
) -> Result<Option<RegisterSnapshot>, StepError> {
    let mut rules = [Rule::Unchanged; MAX_REGISTERS];
    let mut cfa = None;
    let mut instructions = Instructions::new(code, A::KIND);
    while let Some(instruction) = instructions
        .next()
        .map_err(|_| StepError::MalformedProgram)?
    {
        let (register, rule) = match instruction {
            Instruction::CfaRegisterOffset { register, offset } => {
                cfa = Some(Cfa::RegisterOffset(register, offset));
                continue;
            }
            Instruction::CfaExpression(expression) => {
                cfa = Some(Cfa::Expression(expression));
                continue;
            }
            Instruction::SameValue(register) => (register, Rule::Unchanged),
            Instruction::Undefined(register) => (register, Rule::Undefined),
            Instruction::SavedAt { register, offset } => (register, Rule::SavedAt(offset)),
            Instruction::ValCfaOffset { register, offset } => {
                (register, Rule::ValCfaOffset(offset))
            }
            Instruction::Constant { register, value } => (register, Rule::Constant(value)),
            Instruction::InRegister { register, source } => (register, Rule::InRegister(source)),
            Instruction::Unsupported => return Err(StepError::Unsupported),
            Instruction::End => break,
        };
        if let Some(slot) = rules.get_mut(usize::from(register)) {
            *slot = rule;
        }
    }

    // An undefined return address marks the outermost frame, with or without
    // a CFA rule.
    if rules.get(usize::from(A::RA)) == Some(&Rule::Undefined) {
        return Ok(None);
    }

    let cfa = match cfa.ok_or(StepError::MalformedProgram)? {
        Cfa::RegisterOffset(register, offset) => {
            let base = A::register_value(regs, register)
                .ok_or(StepError::RegisterUnavailable(register))?;
            base.checked_add_signed(offset)
                .ok_or(StepError::IntegerOverflow)?
        }
        Cfa::Expression(expression) => evaluate::<A>(
            EndianSlice::new(expression, LittleEndian),
            expression_encoding(A::KIND),
            None,
            regs,
            memory,
        )?,
    };

    let pointer_size = A::KIND.pointer_size();
    let mut caller = *regs;
    caller.set(A::SP, cfa);
    for (register, rule) in rules.iter().enumerate() {
        let register = register as u16;
        let value = match *rule {
            Rule::Unchanged => continue,
            Rule::Undefined => None,
            Rule::SavedAt(offset) => {
                let address = cfa
                    .checked_add_signed(offset)
                    .ok_or(StepError::IntegerOverflow)?;
                Some(memory.read_pointer(address, pointer_size)?)
            }
            Rule::ValCfaOffset(offset) => Some(
                cfa.checked_add_signed(offset)
                    .ok_or(StepError::IntegerOverflow)?,
            ),
            Rule::Constant(value) => Some(value as u64),
            Rule::InRegister(source) => A::register_value(regs, source),
        };
        match value {
            Some(value) => caller.set(register, value),
            None => caller.clear(register),
        }
    }
    Ok(caller_frame::<A>(caller))
}

/// Moves the recovered return address into the program counter. `None` if
/// the return address is undefined or zero, which marks the outermost frame.
pub(crate) fn caller_frame<A: Arch>(mut caller: RegisterSnapshot) -> Option<RegisterSnapshot> {
    let return_address = A::sanitize_return_address(caller.get(A::RA)?);
    if return_address == 0 {
        return None;
    }
    caller.set_pc(return_address);
    Some(caller)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::aarch64::{reg as a64, ArchAarch64};
    use crate::arch::ArchKind;
    use crate::identity::{BinaryIdentity, BuildId};
    use crate::qut::ProgramBuilder;
    use crate::x86_64::{reg, ArchX86_64};

    fn encode(arch: ArchKind, instructions: &[Instruction]) -> Vec<u8> {
        let mut code = Vec::new();
        for instruction in instructions {
            instruction.encode(arch, &mut code).unwrap();
        }
        code
    }

    fn stack(base: u64, words: &[u64]) -> MemorySource {
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        MemorySource::captured(base, bytes)
    }

    fn program(ranges: &[(u64, u64, Vec<u8>)]) -> UnwindProgram {
        let mut builder = ProgramBuilder::new();
        for (start, end, code) in ranges {
            builder.push(*start..*end, code);
        }
        builder.finish(
            BinaryIdentity::new("/lib/libinterp.so", BuildId::Derived(9), 1),
            ArchKind::X86_64,
        )
    }

    #[test]
    fn test_leaf_function() {
        let code = encode(
            ArchKind::X86_64,
            &[
                Instruction::CfaRegisterOffset {
                    register: reg::RSP,
                    offset: 8,
                },
                Instruction::SavedAt {
                    register: reg::RA,
                    offset: -8,
                },
                Instruction::End,
            ],
        );
        let program = program(&[(0x100, 0x200, code)]);
        let memory = stack(0x7000, &[0x4321, 0]);
        let regs = RegisterSnapshot::new(0x1150)
            .with(reg::RSP, 0x7000)
            .with(reg::RBP, 0x7777)
            .with(reg::RBX, 0x55);
        let caller = step::<ArchX86_64>(&program, 0x150, &regs, &memory)
            .unwrap()
            .unwrap();
        assert_eq!(caller.pc(), 0x4321);
        assert_eq!(caller.get(reg::RSP), Some(0x7008));
        // Registers without a rule keep their value.
        assert_eq!(caller.get(reg::RBP), Some(0x7777));
        assert_eq!(caller.get(reg::RBX), Some(0x55));
    }

    #[test]
    fn test_saved_registers_and_rbp_based_cfa() {
        let code = encode(
            ArchKind::X86_64,
            &[
                Instruction::CfaRegisterOffset {
                    register: reg::RBP,
                    offset: 16,
                },
                Instruction::SavedAt {
                    register: reg::RBX,
                    offset: -24,
                },
                Instruction::SavedAt {
                    register: reg::RBP,
                    offset: -16,
                },
                Instruction::SavedAt {
                    register: reg::RA,
                    offset: -8,
                },
                Instruction::End,
            ],
        );
        let program = program(&[(0x0, 0x1000, code)]);
        // 0x7000: [rbx=0xb] [rbp=0x7100] [ra=0x2222]
        let memory = stack(0x7000, &[0xb, 0x7100, 0x2222]);
        let regs = RegisterSnapshot::new(0x10)
            .with(reg::RSP, 0x6fe0)
            .with(reg::RBP, 0x7008);
        let caller = step::<ArchX86_64>(&program, 0x10, &regs, &memory)
            .unwrap()
            .unwrap();
        assert_eq!(caller.pc(), 0x2222);
        assert_eq!(caller.get(reg::RSP), Some(0x7018));
        assert_eq!(caller.get(reg::RBP), Some(0x7100));
        assert_eq!(caller.get(reg::RBX), Some(0xb));
    }

    #[test]
    fn test_no_coverage_and_unsupported() {
        let program = program(&[
            (0x100, 0x110, encode(ArchKind::X86_64, &[Instruction::Unsupported])),
            (
                0x110,
                0x120,
                encode(
                    ArchKind::X86_64,
                    &[
                        Instruction::CfaRegisterOffset {
                            register: reg::RSP,
                            offset: 8,
                        },
                        Instruction::End,
                    ],
                ),
            ),
        ]);
        let memory = stack(0, &[]);
        let regs = RegisterSnapshot::new(0).with(reg::RSP, 0x1000);
        assert_eq!(
            step::<ArchX86_64>(&program, 0xff, &regs, &memory),
            Err(StepError::NoCoverage)
        );
        assert_eq!(
            step::<ArchX86_64>(&program, 0x120, &regs, &memory),
            Err(StepError::NoCoverage)
        );
        assert_eq!(
            step::<ArchX86_64>(&program, 0x10f, &regs, &memory),
            Err(StepError::Unsupported)
        );
        // Half-open ranges: 0x110 belongs to the second entry, which has no
        // rule for the return address column.
        assert_eq!(step::<ArchX86_64>(&program, 0x110, &regs, &memory), Ok(None));
    }

    #[test]
    fn test_memory_fault() {
        let code = encode(
            ArchKind::X86_64,
            &[
                Instruction::CfaRegisterOffset {
                    register: reg::RSP,
                    offset: 8,
                },
                Instruction::SavedAt {
                    register: reg::RA,
                    offset: -8,
                },
                Instruction::End,
            ],
        );
        let program = program(&[(0, 0x10, code)]);
        let memory = stack(0x9000, &[0]);
        let regs = RegisterSnapshot::new(0).with(reg::RSP, 0x1000);
        assert_eq!(
            step::<ArchX86_64>(&program, 0, &regs, &memory),
            Err(StepError::MemoryFault(0x1000))
        );
    }

    #[test]
    fn test_aarch64_leaf_uses_lr() {
        let code = encode(
            ArchKind::Aarch64,
            &[
                Instruction::CfaRegisterOffset {
                    register: a64::SP,
                    offset: 0,
                },
                Instruction::End,
            ],
        );
        let memory = stack(0, &[]);
        let regs = RegisterSnapshot::new(0x1000)
            .with(a64::SP, 0x8000)
            .with(a64::LR, 0x000f_0000_0000_2468);
        let caller = execute::<ArchAarch64>(&code, &regs, &memory)
            .unwrap()
            .unwrap();
        assert_eq!(caller.pc(), 0x2468);
        assert_eq!(caller.get(a64::SP), Some(0x8000));
    }

    #[test]
    fn test_value_rules_and_undefined_return_address() {
        let code = encode(
            ArchKind::X86_64,
            &[
                Instruction::CfaRegisterOffset {
                    register: reg::RSP,
                    offset: 32,
                },
                Instruction::ValCfaOffset {
                    register: reg::RBP,
                    offset: -16,
                },
                Instruction::Constant {
                    register: reg::RBX,
                    value: 42,
                },
                Instruction::InRegister {
                    register: 12,
                    source: 13,
                },
                Instruction::Undefined(reg::RA),
                Instruction::End,
            ],
        );
        let memory = stack(0, &[]);
        let regs = RegisterSnapshot::new(0)
            .with(reg::RSP, 0x1000)
            .with(reg::RA, 0x5555)
            .with(13, 0x1313);
        assert_eq!(execute::<ArchX86_64>(&code, &regs, &memory), Ok(None));

        let mut code = code;
        // Replace `undefined RA; end` with `RA at CFA-8; end`.
        code.truncate(code.len() - 3);
        Instruction::SavedAt {
            register: reg::RA,
            offset: -8,
        }
        .encode(ArchKind::X86_64, &mut code)
        .unwrap();
        Instruction::End.encode(ArchKind::X86_64, &mut code).unwrap();
        let memory = stack(0x1018, &[0x7777]);
        let caller = execute::<ArchX86_64>(&code, &regs, &memory)
            .unwrap()
            .unwrap();
        assert_eq!(caller.pc(), 0x7777);
        assert_eq!(caller.get(reg::RBP), Some(0x1010));
        assert_eq!(caller.get(reg::RBX), Some(42));
        assert_eq!(caller.get(12), Some(0x1313));
    }

    #[test]
    fn test_cfa_expression() {
        // DW_OP_breg7 (rsp) +16
        let code = encode(
            ArchKind::X86_64,
            &[
                Instruction::CfaExpression(&[0x77, 0x10]),
                Instruction::SavedAt {
                    register: reg::RA,
                    offset: -8,
                },
                Instruction::End,
            ],
        );
        let memory = stack(0x1008, &[0xabc]);
        let regs = RegisterSnapshot::new(0).with(reg::RSP, 0x1000);
        let caller = execute::<ArchX86_64>(&code, &regs, &memory)
            .unwrap()
            .unwrap();
        assert_eq!(caller.get(reg::RSP), Some(0x1010));
        assert_eq!(caller.pc(), 0xabc);
    }

    #[test]
    fn test_missing_cfa_is_malformed() {
        let code = encode(ArchKind::X86_64, &[Instruction::End]);
        let regs = RegisterSnapshot::new(0);
        assert_eq!(
            execute::<ArchX86_64>(&code, &regs, &stack(0, &[])),
            Err(StepError::MalformedProgram)
        );
    }
}
