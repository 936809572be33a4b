//! Stack unwinding from compiled call frame information.
//!
//! The DWARF CFI and ARM exception index tables of each image are compiled
//! once into a compact bytecode program ([`UnwindProgram`]). Programs are
//! cached in memory and on disk, keyed by [`BinaryIdentity`], and executed by
//! an interpreter that neither allocates nor locks, so that stacks can be
//! walked from a signal handler.
//!
//! The [`Unwinder`] drives a walk frame by frame. When the compiled program
//! cannot handle a frame, it falls back to direct DWARF evaluation, then to
//! the frame pointer chain, then to the ARM exception index.
//!
//! A walk starts from a [`RegisterSnapshot`]. Inside a signal handler on
//! Linux, `RegisterSnapshot::from_ucontext` builds one from the handler's
//! `ucontext_t`.
//!
//! ```no_run
//! use quicken_unwind::x86_64::reg;
//! use quicken_unwind::{RegisterSnapshot, UnwinderConfig, UnwinderX86_64};
//!
//! let unwinder = UnwinderX86_64::new(UnwinderConfig::default().with_cache_dir("/tmp/qut"));
//! # let (pc, sp, fp) = (0, 0, 0);
//! let regs = RegisterSnapshot::new(pc)
//!     .with(reg::RSP, sp)
//!     .with(reg::RBP, fp);
//! let result = unwinder.unwind(&regs);
//! for frame in &result.frames {
//!     println!("{frame:?}");
//! }
//! ```

mod arch;
mod cache;
mod compiler;
mod config;
mod display_utils;
mod dwarf;
mod error;
mod frame;
mod identity;
mod maps;
mod memory;
mod regs;
mod sections;
mod stats;
mod store;
mod unwinder;

pub mod aarch64;
pub mod arm;
pub mod interpreter;
pub mod qut;
pub mod x86_64;

pub use arch::{Arch, ArchKind};
pub use cache::QutCache;
pub use compiler::compile_image;
pub use config::UnwinderConfig;
pub use error::{CacheError, CompileError, MapsError, MemoryError, StepError};
pub use frame::{Frame, TerminationReason, UnwindMethod, UnwindResult, WalkSummary};
pub use identity::{BinaryIdentity, BuildId};
pub use maps::{parse_maps, AddressSpace, Image, MappedRegion, MapsSnapshot, Permissions, RawMapping};
pub use memory::MemorySource;
pub use qut::{EntryRef, ProgramBuilder, UnwindProgram};
pub use regs::{RegisterSnapshot, MAX_REGISTERS};
pub use sections::{ImageBytes, LoadSegment, SectionData, UnwindSections};
pub use stats::{CompileStatistics, StatisticEvent, StatisticsHook};
pub use store::DiskStore;
pub use unwinder::{UnwindMode, Unwinder};

pub type UnwinderX86_64 = Unwinder<x86_64::ArchX86_64>;
pub type UnwinderAarch64 = Unwinder<aarch64::ArchAarch64>;
pub type UnwinderArm = Unwinder<arm::ArchArm>;

#[cfg(target_arch = "x86_64")]
pub type UnwinderNative = UnwinderX86_64;
#[cfg(target_arch = "aarch64")]
pub type UnwinderNative = UnwinderAarch64;
#[cfg(target_arch = "arm")]
pub type UnwinderNative = UnwinderArm;
