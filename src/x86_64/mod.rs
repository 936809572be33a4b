mod arch;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod context;
mod framepointer;

pub use arch::*;

/// DWARF register numbers.
pub mod reg {
    pub const RBX: u16 = 3;
    pub const RBP: u16 = 6;
    pub const RSP: u16 = 7;
    /// The return address column. x86_64 has no link register; the CFI
    /// column 16 describes where the return address is stored.
    pub const RA: u16 = 16;
}
