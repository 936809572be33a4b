//! The compiled unwind table format: instructions, programs and their
//! persisted form.

pub mod format;
pub mod instruction;
mod program;

pub use instruction::{Instruction, Instructions};
pub use program::{EntryRef, ProgramBuilder, UnwindProgram};
