use crate::error::StepError;
use crate::memory::MemorySource;
use crate::regs::RegisterSnapshot;

/// The architectures an [`UnwindProgram`](crate::UnwindProgram) can target.
///
/// The discriminant is the architecture code stored in persisted programs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ArchKind {
    X86_64 = 1,
    Aarch64 = 2,
    Arm = 3,
}

impl ArchKind {
    /// The architecture this crate was compiled for, if it is supported.
    pub fn native() -> Option<ArchKind> {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                Some(ArchKind::X86_64)
            } else if #[cfg(target_arch = "aarch64")] {
                Some(ArchKind::Aarch64)
            } else if #[cfg(target_arch = "arm")] {
                Some(ArchKind::Arm)
            } else {
                None
            }
        }
    }

    pub fn from_code(code: u8) -> Option<ArchKind> {
        match code {
            1 => Some(ArchKind::X86_64),
            2 => Some(ArchKind::Aarch64),
            3 => Some(ArchKind::Arm),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_object(arch: object::Architecture) -> Option<ArchKind> {
        match arch {
            object::Architecture::X86_64 => Some(ArchKind::X86_64),
            object::Architecture::Aarch64 => Some(ArchKind::Aarch64),
            object::Architecture::Arm => Some(ArchKind::Arm),
            _ => None,
        }
    }

    /// The size of a stack slot and of a saved register, in bytes.
    pub fn pointer_size(self) -> u8 {
        match self {
            ArchKind::X86_64 | ArchKind::Aarch64 => 8,
            ArchKind::Arm => 4,
        }
    }

    /// The DWARF number of the stack pointer.
    pub fn sp_register(self) -> u16 {
        match self {
            ArchKind::X86_64 => crate::x86_64::reg::RSP,
            ArchKind::Aarch64 => crate::aarch64::reg::SP,
            ArchKind::Arm => crate::arm::reg::SP,
        }
    }

    /// The DWARF number of the register (or CFI column) holding the return address.
    pub fn return_address_register(self) -> u16 {
        match self {
            ArchKind::X86_64 => crate::x86_64::reg::RA,
            ArchKind::Aarch64 => crate::aarch64::reg::LR,
            ArchKind::Arm => crate::arm::reg::LR,
        }
    }
}

/// Compile-time description of one CPU architecture.
pub trait Arch: Send + Sync + 'static {
    const KIND: ArchKind;
    const SP: u16;
    const FP: u16;
    const RA: u16;

    /// The address used to look up unwind information for `pc`. Return
    /// addresses point after the call instruction, so for every frame but the
    /// first we look up the byte before it.
    fn lookup_address(pc: u64, is_first_frame: bool) -> u64 {
        if is_first_frame {
            pc
        } else {
            pc.saturating_sub(1)
        }
    }

    /// The value of the CFI column `register` in this frame. Columns that are
    /// not general purpose registers are mapped here.
    fn register_value(regs: &RegisterSnapshot, register: u16) -> Option<u64> {
        regs.get(register)
    }

    /// Cleans up a return address read from the stack or from a register.
    fn sanitize_return_address(address: u64) -> u64 {
        address
    }

    /// Recovers the caller's registers by following the frame pointer chain.
    /// `Ok(None)` means the chain ended.
    fn unwind_frame_pointer(
        regs: &RegisterSnapshot,
        memory: &MemorySource,
    ) -> Result<Option<RegisterSnapshot>, StepError>;
}
