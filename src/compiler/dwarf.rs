use gimli::{
    BaseAddresses, CfaRule, CieOrFde, FrameDescriptionEntry, Reader, RegisterRule, UnwindContext,
    UnwindOffset, UnwindSection, UnwindTableRow,
};

use crate::arch::ArchKind;
use crate::qut::{Instruction, ProgramBuilder};
use crate::regs::MAX_REGISTERS;
use crate::stats::CompileStatistics;

/// Compiles every FDE of a `.eh_frame` or `.debug_frame` section into
/// `builder`. Damaged FDEs are skipped or downgraded to the unsupported
/// sentinel; they never fail the whole section.
pub(crate) fn compile_cfi<R, US>(
    section: &US,
    bases: &BaseAddresses,
    arch: ArchKind,
    builder: &mut ProgramBuilder,
    stats: &mut CompileStatistics,
) where
    R: Reader,
    US: UnwindSection<R>,
{
    let mut context = Box::new(UnwindContext::new());
    let mut code = Vec::with_capacity(32);
    let mut cur_cie = None;
    let mut entries_iter = section.entries(bases);
    loop {
        let entry = match entries_iter.next() {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                // Without a valid length we cannot find the next entry.
                tracing::debug!("Stopping CFI parsing: {e}");
                stats.malformed_fdes += 1;
                break;
            }
        };
        let fde = match entry {
            CieOrFde::Cie(cie) => {
                cur_cie = Some(cie);
                continue;
            }
            CieOrFde::Fde(partial_fde) => {
                let fde = partial_fde.parse(|unwind_section, bases, cie_offset| {
                    if let Some(cie) = &cur_cie {
                        if cie.offset() == <US::Offset as UnwindOffset<R::Offset>>::into(cie_offset) {
                            return Ok(cie.clone());
                        }
                    }
                    let cie = unwind_section.cie_from_offset(bases, cie_offset);
                    if let Ok(cie) = &cie {
                        cur_cie = Some(cie.clone());
                    }
                    cie
                });
                match fde {
                    Ok(fde) => fde,
                    Err(e) => {
                        tracing::trace!("Skipping malformed FDE: {e}");
                        stats.malformed_fdes += 1;
                        continue;
                    }
                }
            }
        };
        compile_fde(section, bases, &fde, &mut context, arch, builder, stats, &mut code);
    }
}

#[allow(clippy::too_many_arguments)]
fn compile_fde<R, US>(
    section: &US,
    bases: &BaseAddresses,
    fde: &FrameDescriptionEntry<R>,
    context: &mut UnwindContext<R::Offset>,
    arch: ArchKind,
    builder: &mut ProgramBuilder,
    stats: &mut CompileStatistics,
    code: &mut Vec<u8>,
) where
    R: Reader,
    US: UnwindSection<R>,
{
    let fde_start = fde.initial_address();
    let fde_end = fde_start.wrapping_add(fde.len());
    let mut covered_until = fde_start;
    let result = fde.rows(section, bases, context).and_then(|mut table| {
        while let Some(row) = table.next_row()? {
            code.clear();
            translate_row(row, section, arch, stats, code);
            stats.record_code(code, arch);
            builder.push(row.start_address()..row.end_address(), code);
            covered_until = row.end_address();
        }
        Ok(())
    });
    if let Err(e) = result {
        tracing::trace!("CFI program of FDE at 0x{fde_start:x} is malformed: {e}");
        stats.malformed_fdes += 1;
        if covered_until < fde_end {
            code.clear();
            let _ = Instruction::Unsupported.encode(arch, code);
            builder.push(covered_until..fde_end, code);
        }
    }
}

/// Translates one row of the CFI table into encoded instructions. Rows that
/// need more than the Quicken instruction set can express become the
/// unsupported sentinel.
pub(crate) fn translate_row<R, US>(
    row: &UnwindTableRow<R::Offset>,
    section: &US,
    arch: ArchKind,
    stats: &mut CompileStatistics,
    out: &mut Vec<u8>,
) where
    R: Reader,
    US: UnwindSection<R>,
{
    if encode_row(row, section, arch, stats, out).is_none() {
        out.clear();
        let _ = Instruction::Unsupported.encode(arch, out);
    }
}

fn encode_row<R, US>(
    row: &UnwindTableRow<R::Offset>,
    section: &US,
    arch: ArchKind,
    stats: &mut CompileStatistics,
    out: &mut Vec<u8>,
) -> Option<()>
where
    R: Reader,
    US: UnwindSection<R>,
{
    match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => {
            if usize::from(register.0) >= MAX_REGISTERS {
                stats.unsupported_cfa_rules += 1;
                return None;
            }
            Instruction::CfaRegisterOffset {
                register: register.0,
                offset: *offset,
            }
            .encode(arch, out)
            .ok()?;
        }
        CfaRule::Expression(expression) => {
            let expression = expression.get(section).ok();
            let bytes = expression.as_ref().and_then(|e| e.0.to_slice().ok());
            let Some(bytes) = bytes else {
                stats.unsupported_cfa_rules += 1;
                return None;
            };
            Instruction::CfaExpression(&bytes[..]).encode(arch, out).ok()?;
        }
    }

    let mut rules: Vec<_> = row
        .registers()
        .filter(|(register, _)| usize::from(register.0) < MAX_REGISTERS)
        .collect();
    rules.sort_by_key(|(register, _)| register.0);
    for (register, rule) in rules {
        let register = register.0;
        let instruction = match rule {
            RegisterRule::Undefined => Instruction::Undefined(register),
            RegisterRule::SameValue => Instruction::SameValue(register),
            RegisterRule::Offset(offset) => Instruction::SavedAt {
                register,
                offset: *offset,
            },
            RegisterRule::ValOffset(offset) => Instruction::ValCfaOffset {
                register,
                offset: *offset,
            },
            RegisterRule::Constant(value) => Instruction::Constant {
                register,
                value: *value as i64,
            },
            RegisterRule::Register(source) if usize::from(source.0) < MAX_REGISTERS => {
                Instruction::InRegister {
                    register,
                    source: source.0,
                }
            }
            _ => {
                stats.unsupported_register_rules += 1;
                return None;
            }
        };
        instruction.encode(arch, out).ok()?;
    }
    Instruction::End.encode(arch, out).ok()
}
