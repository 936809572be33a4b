//! Compiles the unwind information of a binary image into an
//! [`UnwindProgram`].
//!
//! The sources are layered by priority: `.eh_frame` first, then
//! `.debug_frame`, then `.ARM.exidx`. A lower-priority source only fills
//! address ranges that no higher-priority source covers.

use gimli::{DebugFrame, EhFrame, LittleEndian};

use crate::arch::ArchKind;
use crate::error::CompileError;
use crate::identity::BinaryIdentity;
use crate::qut::{ProgramBuilder, UnwindProgram};
use crate::sections::UnwindSections;
use crate::stats::{CompileStatistics, StatisticsHook};

mod dwarf;
pub(crate) mod exidx;

pub(crate) use dwarf::translate_row;

/// Compiles all unwind sections of one image.
///
/// Damaged frame descriptors and unsupported rules only affect the address
/// ranges they describe; those ranges are either skipped or marked as
/// unsupported. An image without unwind sections compiles to an empty
/// program.
pub fn compile_image(
    identity: BinaryIdentity,
    sections: &UnwindSections,
    expected_arch: ArchKind,
    hook: Option<&StatisticsHook>,
) -> Result<UnwindProgram, CompileError> {
    if sections.arch() != expected_arch {
        return Err(CompileError::ArchitectureMismatch {
            expected: expected_arch,
            found: Some(sections.arch()),
        });
    }
    tracing::debug!("Compiling unwind information of {identity}");

    let arch = expected_arch;
    let bases = sections.base_addresses();
    let mut stats = CompileStatistics::default();

    let mut builder = ProgramBuilder::new();
    if let Some(eh_frame) = &sections.eh_frame {
        let mut section = EhFrame::new(eh_frame.data(), LittleEndian);
        section.set_address_size(arch.pointer_size());
        dwarf::compile_cfi(&section, &bases, arch, &mut builder, &mut stats);
    }
    if let Some(debug_frame) = &sections.debug_frame {
        let mut section = DebugFrame::new(debug_frame.data(), LittleEndian);
        section.set_address_size(arch.pointer_size());
        let mut lower = ProgramBuilder::new();
        dwarf::compile_cfi(&section, &bases, arch, &mut lower, &mut stats);
        builder.fill_gaps(lower);
    }
    if arch == ArchKind::Arm && sections.arm_exidx.is_some() {
        let mut lower = ProgramBuilder::new();
        exidx::compile_exidx(sections, &mut lower, &mut stats);
        builder.fill_gaps(lower);
    }

    let program = builder.finish(identity, arch);
    stats.entries = program.len() as u64;
    tracing::info!(
        "Compiled {} entries ({} code bytes) for {}",
        program.len(),
        program.code_size(),
        program.identity()
    );
    if let Some(hook) = hook {
        stats.report(hook);
    }
    Ok(program)
}
