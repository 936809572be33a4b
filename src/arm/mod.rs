mod arch;
#[cfg(all(target_os = "linux", target_arch = "arm"))]
mod context;
mod framepointer;

pub use arch::*;

/// DWARF register numbers.
pub mod reg {
    pub const R4: u16 = 4;
    /// The frame pointer in Thumb code.
    pub const R7: u16 = 7;
    /// The frame pointer in ARM code.
    pub const R11: u16 = 11;
    pub const SP: u16 = 13;
    pub const LR: u16 = 14;
    pub const PC: u16 = 15;
}
