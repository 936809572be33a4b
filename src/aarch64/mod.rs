mod arch;
#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
mod context;
mod framepointer;

pub use arch::*;

/// DWARF register numbers.
pub mod reg {
    pub const X19: u16 = 19;
    pub const FP: u16 = 29;
    pub const LR: u16 = 30;
    pub const SP: u16 = 31;
}
