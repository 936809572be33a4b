//! Direct evaluation of DWARF CFI, without compiling it first.
//!
//! This is the strategy for ranges the compiler could not express, and it is
//! only used outside of signal handlers: looking up the FDE and running its
//! CFI program allocates.

use gimli::{
    BaseAddresses, CfaRule, DebugFrame, EhFrame, EhFrameHdr, Encoding, EndianSlice, Evaluation,
    EvaluationResult, Format, LittleEndian, Location, Piece, Reader, RegisterRule, UnwindContext,
    UnwindSection, Value,
};

use crate::arch::{Arch, ArchKind};
use crate::error::StepError;
use crate::interpreter::caller_frame;
use crate::memory::MemorySource;
use crate::regs::RegisterSnapshot;
use crate::sections::UnwindSections;

type Slice<'a> = EndianSlice<'a, LittleEndian>;

/// Fixed-size storage for gimli's expression evaluator, so that expressions
/// embedded in compiled programs can be evaluated without allocating.
pub(crate) struct StoreOnStack;

impl<R: Reader> gimli::EvaluationStorage<R> for StoreOnStack {
    type Stack = [Value; 64];
    type ExpressionStack = [(R, R); 4];
    type Result = [Piece<R>; 1];
}

/// The encoding used for expressions stored in compiled programs.
pub(crate) fn expression_encoding(arch: ArchKind) -> Encoding {
    Encoding {
        format: Format::Dwarf32,
        version: 4,
        address_size: arch.pointer_size(),
    }
}

/// Evaluates a DWARF expression that computes an address. Register rule
/// expressions start with the CFA pushed on the stack; pass it as `cfa`.
pub(crate) fn evaluate<A: Arch>(
    expression: Slice<'_>,
    encoding: Encoding,
    cfa: Option<u64>,
    regs: &RegisterSnapshot,
    memory: &MemorySource,
) -> Result<u64, StepError> {
    let mut eval = Evaluation::<_, StoreOnStack>::new_in(expression, encoding);
    if let Some(cfa) = cfa {
        eval.set_initial_value(cfa);
    }
    let mut result = eval.evaluate()?;
    loop {
        match result {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresRegister { register, .. } => {
                let value = A::register_value(regs, register.0)
                    .ok_or(StepError::RegisterUnavailable(register.0))?;
                result = eval.resume_with_register(Value::Generic(value))?;
            }
            EvaluationResult::RequiresMemory {
                address,
                size,
                space: None,
                ..
            } => {
                let value = memory.read_sized(address, size)?;
                result = eval.resume_with_memory(Value::Generic(value))?;
            }
            _ => return Err(StepError::Unsupported),
        }
    }
    match eval.as_result().last() {
        Some(Piece {
            location: Location::Address { address },
            ..
        }) => Ok(*address),
        _ => Err(StepError::Unsupported),
    }
}

/// Unwinds one frame by looking up the FDE covering `svma` in `.eh_frame`
/// (through `.eh_frame_hdr` if present) or `.debug_frame`, and evaluating
/// its CFI row directly.
pub(crate) fn step<A: Arch>(
    sections: &UnwindSections,
    svma: u64,
    regs: &RegisterSnapshot,
    memory: &MemorySource,
) -> Result<Option<RegisterSnapshot>, StepError> {
    let bases = sections.base_addresses();
    let address_size = A::KIND.pointer_size();

    if let Some(eh_frame) = &sections.eh_frame {
        let mut section = EhFrame::new(eh_frame.data(), LittleEndian);
        section.set_address_size(address_size);
        let hdr = sections.eh_frame_hdr.as_ref().and_then(|hdr| {
            EhFrameHdr::new(hdr.data(), LittleEndian)
                .parse(&bases, address_size)
                .ok()
        });
        let fde = match hdr.as_ref().and_then(|hdr| hdr.table()) {
            Some(table) => table.fde_for_address(&section, &bases, svma, EhFrame::cie_from_offset),
            None => section.fde_for_address(&bases, svma, EhFrame::cie_from_offset),
        };
        match fde {
            Ok(fde) => match unwind_with_fde::<A, _>(&section, &bases, &fde, svma, regs, memory) {
                Err(StepError::Dwarf(gimli::Error::NoUnwindInfoForAddress)) => {}
                result => return result,
            },
            Err(gimli::Error::NoUnwindInfoForAddress) => {}
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(debug_frame) = &sections.debug_frame {
        let mut section = DebugFrame::new(debug_frame.data(), LittleEndian);
        section.set_address_size(address_size);
        match section.fde_for_address(&bases, svma, DebugFrame::cie_from_offset) {
            Ok(fde) => return unwind_with_fde::<A, _>(&section, &bases, &fde, svma, regs, memory),
            Err(gimli::Error::NoUnwindInfoForAddress) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Err(StepError::NoCoverage)
}

fn unwind_with_fde<'a, A: Arch, US: UnwindSection<Slice<'a>>>(
    section: &US,
    bases: &BaseAddresses,
    fde: &gimli::FrameDescriptionEntry<Slice<'a>>,
    svma: u64,
    regs: &RegisterSnapshot,
    memory: &MemorySource,
) -> Result<Option<RegisterSnapshot>, StepError> {
    let mut context = Box::new(UnwindContext::new());
    let row = fde.unwind_info_for_address(section, bases, &mut *context, svma)?;
    let encoding = fde.cie().encoding();

    let cfa = match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => {
            let base = A::register_value(regs, register.0)
                .ok_or(StepError::RegisterUnavailable(register.0))?;
            base.checked_add_signed(*offset)
                .ok_or(StepError::IntegerOverflow)?
        }
        CfaRule::Expression(expression) => {
            evaluate::<A>(expression.get(section)?.0, encoding, None, regs, memory)?
        }
    };

    let pointer_size = A::KIND.pointer_size();
    let mut caller = *regs;
    caller.set(A::SP, cfa);
    for (register, rule) in row.registers() {
        let value = match rule {
            RegisterRule::Undefined => None,
            RegisterRule::SameValue => continue,
            RegisterRule::Offset(offset) => {
                let address = cfa
                    .checked_add_signed(*offset)
                    .ok_or(StepError::IntegerOverflow)?;
                Some(memory.read_pointer(address, pointer_size)?)
            }
            RegisterRule::ValOffset(offset) => Some(
                cfa.checked_add_signed(*offset)
                    .ok_or(StepError::IntegerOverflow)?,
            ),
            RegisterRule::Register(source) => A::register_value(regs, source.0),
            RegisterRule::Expression(expression) => {
                let expression = expression.get(section)?.0;
                let address = evaluate::<A>(expression, encoding, Some(cfa), regs, memory)?;
                Some(memory.read_pointer(address, pointer_size)?)
            }
            RegisterRule::ValExpression(expression) => Some(evaluate::<A>(
                expression.get(section)?.0,
                encoding,
                Some(cfa),
                regs,
                memory,
            )?),
            RegisterRule::Constant(value) => Some(*value),
            _ => return Err(StepError::Unsupported),
        };
        match value {
            Some(value) => caller.set(register.0, value),
            None => caller.clear(register.0),
        }
    }
    Ok(caller_frame::<A>(caller))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::compiler::compile_image;
    use crate::compiler::test::debug_frame_with_fde;
    use crate::identity::{BinaryIdentity, BuildId};
    use crate::interpreter;
    use crate::sections::SectionData;
    use crate::x86_64::{reg, ArchX86_64};

    fn eval(
        expression: &[u8],
        cfa: Option<u64>,
        regs: &RegisterSnapshot,
        memory: &MemorySource,
    ) -> Result<u64, StepError> {
        let expression = EndianSlice::new(expression, LittleEndian);
        let encoding = expression_encoding(ArchKind::X86_64);
        evaluate::<ArchX86_64>(expression, encoding, cfa, regs, memory)
    }

    #[test]
    fn test_evaluate_breg_and_deref() {
        let regs = RegisterSnapshot::new(0).with(reg::RSP, 0x1000);
        let memory = MemorySource::captured(0x1010, 0x2000u64.to_le_bytes().to_vec());
        // DW_OP_breg7 16
        assert_eq!(eval(&[0x77, 0x10], None, &regs, &memory), Ok(0x1010));
        // DW_OP_breg7 16; DW_OP_deref
        assert_eq!(eval(&[0x77, 0x10, 0x06], None, &regs, &memory), Ok(0x2000));
        // DW_OP_breg3 0, but rbx is unknown.
        assert_eq!(
            eval(&[0x73, 0x00], None, &regs, &memory),
            Err(StepError::RegisterUnavailable(reg::RBX))
        );
    }

    #[test]
    fn test_evaluate_reads_rip_from_pc() {
        let regs = RegisterSnapshot::new(0x41234).with(reg::RSP, 0x1000);
        let memory = MemorySource::captured(0, Vec::new());
        // DW_OP_breg16 4
        assert_eq!(eval(&[0x80, 0x04], None, &regs, &memory), Ok(0x41238));
    }

    #[test]
    fn test_register_rule_expression_starts_with_cfa() {
        let regs = RegisterSnapshot::new(0).with(reg::RSP, 0x1000);
        let memory = MemorySource::captured(0, Vec::new());
        // DW_OP_plus_uconst 8
        assert_eq!(eval(&[0x23, 0x08], Some(0x2000), &regs, &memory), Ok(0x2008));
        assert!(eval(&[0x23, 0x08], None, &regs, &memory).is_err());
    }

    #[test]
    fn test_step_without_coverage() {
        let sections = crate::sections::UnwindSections::new(ArchKind::X86_64)
            .with_debug_frame(SectionData::new(Vec::new(), 0));
        let regs = RegisterSnapshot::new(0).with(reg::RSP, 0x1000);
        assert_eq!(
            step::<ArchX86_64>(&sections, 0x10, &regs, &MemorySource::captured(0, Vec::new())),
            Err(StepError::NoCoverage)
        );
    }

    #[test]
    fn test_compiled_program_matches_direct_evaluation() {
        let functions: [&[u8]; 3] = [
            // push rbp; mov rbp, rsp; ...; pop rbp
            &[
                0x41, 0x0e, 0x10, 0x86, 0x02, // +1: cfa = rsp+16, rbp at cfa-16
                0x43, 0x0d, 0x06, // +4: cfa = rbp+16
                0x50, 0x0c, 0x07, 0x08, // +20: cfa = rsp+8
            ],
            // rbx = cfa-16, r12 holds rbp, rbx undefined later
            &[0x14, 0x03, 0x02, 0x09, 0x06, 0x0c, 0x44, 0x07, 0x03, 0x08, 0x0c],
            // cfa = rsp+24, rbx at cfa-24
            &[0x0e, 0x18, 0x83, 0x03],
        ];
        let mut data = Vec::new();
        for (index, instructions) in functions.iter().enumerate() {
            let start = 0x1000 * (index as u64 + 1);
            let fde = debug_frame_with_fde(instructions, start, 0x30);
            if index == 0 {
                data = fde;
            } else {
                // Every FDE refers to the CIE at offset 0; drop the copy.
                data.extend_from_slice(&fde[20..]);
            }
        }
        let sections = UnwindSections::new(ArchKind::X86_64).with_debug_frame(SectionData::new(data, 0));
        let identity = BinaryIdentity::new("/lib/libequiv.so", BuildId::Derived(1), 1);
        let program = compile_image(identity, &sections, ArchKind::X86_64, None).unwrap();

        let words: Vec<u8> = (0..0x400u64)
            .flat_map(|i| (0x10_0000 + i * 8).to_le_bytes())
            .collect();
        let memory = MemorySource::captured(0x7000, words);
        for function in 1..=3u64 {
            for pc in function * 0x1000..function * 0x1000 + 0x30 {
                let regs = RegisterSnapshot::new(pc)
                    .with(reg::RSP, 0x7800)
                    .with(reg::RBP, 0x7900)
                    .with(reg::RBX, 0x33)
                    .with(12, 0x44);
                let compiled = interpreter::step::<ArchX86_64>(&program, pc, &regs, &memory);
                let direct = step::<ArchX86_64>(&sections, pc, &regs, &memory);
                assert_eq!(compiled, direct, "pc 0x{pc:x}");
                assert!(compiled.unwrap().is_some());
            }
        }
    }
}
