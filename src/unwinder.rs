use std::marker::PhantomData;
use std::sync::Arc;

use arrayvec::ArrayVec;
use parking_lot::Mutex;

use crate::arch::{Arch, ArchKind};
use crate::cache::QutCache;
use crate::compiler::{compile_image, exidx};
use crate::config::UnwinderConfig;
use crate::dwarf;
use crate::error::StepError;
use crate::frame::{Frame, TerminationReason, UnwindMethod, UnwindResult, WalkSummary};
use crate::interpreter;
use crate::maps::{AddressSpace, Image, MappedRegion, MapsSnapshot};
use crate::memory::MemorySource;
use crate::regs::RegisterSnapshot;
use crate::store::DiskStore;

/// Images seen by fast-path walks without a compiled program are remembered
/// up to this count.
const PENDING_CAPACITY: usize = 64;

/// The order in which strategies are tried for each frame.
const STRATEGIES: [UnwindMethod; 4] = [
    UnwindMethod::Quicken,
    UnwindMethod::FullDwarf,
    UnwindMethod::FramePointer,
    UnwindMethod::Ehabi,
];

/// Where a walk may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindMode {
    /// May block, compile programs, touch the disk and log.
    Normal,
    /// Safe to use from a signal handler: only programs that are already in
    /// memory are used, nothing blocks, allocates or logs. Images without a
    /// program fall back to the frame pointer and are queued for
    /// [`Unwinder::consume_pending`].
    FastPathOnly,
}

/// Walks stacks of one architecture.
///
/// For each frame, the strategies are tried in order: the compiled program
/// of the frame's image, direct DWARF evaluation, the frame pointer chain
/// and the ARM exception index. The first one that produces a caller frame
/// wins, and the next frame starts over at the compiled program.
///
/// An `Unwinder` owns its program cache, so tests and independent monitors
/// can each construct their own.
pub struct Unwinder<A: Arch> {
    config: UnwinderConfig,
    space: Arc<AddressSpace>,
    memory: MemorySource,
    cache: QutCache,
    pending: Mutex<ArrayVec<Arc<Image>, PENDING_CAPACITY>>,
    _arch: PhantomData<A>,
}

enum Step {
    Caller(RegisterSnapshot),
    Outermost,
    Failed,
    OutOfSteps,
}

struct WalkState<'a> {
    memory: &'a MemorySource,
    mode: UnwindMode,
    steps: usize,
}

impl<A: Arch> Unwinder<A> {
    /// An unwinder for the current process.
    pub fn new(config: UnwinderConfig) -> Self {
        Self::with_address_space(config, Arc::new(AddressSpace::for_self()), MemorySource::local())
    }

    /// An unwinder for an explicit address space and memory source, for
    /// example a captured sample.
    pub fn with_address_space(
        config: UnwinderConfig,
        space: Arc<AddressSpace>,
        memory: MemorySource,
    ) -> Self {
        let disk = config.cache_dir.as_ref().and_then(|dir| {
            match DiskStore::new(dir.clone(), A::KIND, config.disk_max_age) {
                Ok(disk) => Some(disk),
                Err(e) => {
                    tracing::warn!("Disk cache disabled: {e}");
                    None
                }
            }
        });
        Self {
            cache: QutCache::new(A::KIND, disk),
            config,
            space,
            memory,
            pending: Mutex::new(ArrayVec::new()),
            _arch: PhantomData,
        }
    }

    pub fn config(&self) -> &UnwinderConfig {
        &self.config
    }

    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    pub fn cache(&self) -> &QutCache {
        &self.cache
    }

    /// Unwinds the stack described by `regs`, which must have been captured
    /// in this unwinder's address space.
    pub fn unwind(&self, regs: &RegisterSnapshot) -> UnwindResult {
        let mut frames = Vec::new();
        let summary = self.walk(
            &self.space,
            &self.memory,
            regs,
            self.config.max_frames,
            UnwindMode::Normal,
            |frame| frames.push(frame),
        );
        UnwindResult {
            frames,
            reason: summary.reason,
        }
    }

    /// Unwinds into a caller-provided buffer. In
    /// [`UnwindMode::FastPathOnly`], this is the form to use from a signal
    /// handler.
    ///
    /// Overwritten entries are dropped, so the buffer should not hold the
    /// last reference to an image.
    pub fn unwind_into(
        &self,
        regs: &RegisterSnapshot,
        frames: &mut [Frame],
        mode: UnwindMode,
    ) -> WalkSummary {
        let limit = frames.len().min(self.config.max_frames);
        let mut slots = frames.iter_mut();
        self.walk(&self.space, &self.memory, regs, limit, mode, |frame| {
            if let Some(slot) = slots.next() {
                *slot = frame;
            }
        })
    }

    /// Unwinds a thread of another process. The process's maps are read
    /// fresh for this walk; compiled programs are shared with local walks.
    pub fn unwind_remote(
        &self,
        pid: i32,
        regs: &RegisterSnapshot,
        max_frames: usize,
    ) -> UnwindResult {
        let space = AddressSpace::for_process(pid);
        let memory = MemorySource::remote(pid, self.config.remote_chunk_size);
        let mut frames = Vec::new();
        let summary = self.walk(
            &space,
            &memory,
            regs,
            max_frames.min(self.config.max_frames),
            UnwindMode::Normal,
            |frame| frames.push(frame),
        );
        UnwindResult {
            frames,
            reason: summary.reason,
        }
    }

    /// Must be called after a module was loaded or unloaded.
    pub fn notify_maps_changed(&self) {
        self.space.notify_maps_changed();
    }

    /// Builds the programs for images that fast-path walks found without
    /// one. Returns how many images were processed.
    pub fn consume_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        for image in &pending {
            self.program_for(image);
        }
        if !pending.is_empty() {
            tracing::info!("Built programs for {} deferred images", pending.len());
        }
        pending.len()
    }

    fn program_for(&self, image: &Image) -> Option<Arc<crate::UnwindProgram>> {
        let sections = image.sections()?;
        let identity = image.identity();
        Some(self.cache.get_or_build(identity, || {
            compile_image(
                identity.clone(),
                sections,
                A::KIND,
                self.config.stats_hook.as_ref(),
            )
        }))
    }

    fn defer(&self, image: &Arc<Image>) {
        // A contended lock drops the record instead of waiting.
        let Some(mut pending) = self.pending.try_lock() else {
            return;
        };
        if !pending.iter().any(|p| p.identity() == image.identity()) {
            let _ = pending.try_push(Arc::clone(image));
        }
    }

    fn walk(
        &self,
        space: &AddressSpace,
        memory: &MemorySource,
        regs: &RegisterSnapshot,
        limit: usize,
        mode: UnwindMode,
        mut push: impl FnMut(Frame),
    ) -> WalkSummary {
        let summary = |frame_count, reason| WalkSummary {
            frame_count,
            reason,
        };
        if matches!(memory, MemorySource::Local(_)) && ArchKind::native() != Some(A::KIND) {
            return summary(0, TerminationReason::UnsupportedArchitecture);
        }
        if limit == 0 {
            return summary(0, TerminationReason::Truncated);
        }

        let snapshot = match mode {
            UnwindMode::Normal => {
                let snapshot = space.snapshot();
                for identity in space.take_unloaded() {
                    self.cache.invalidate(&identity);
                }
                snapshot
            }
            UnwindMode::FastPathOnly => match space.try_snapshot() {
                Some(snapshot) => snapshot,
                None => {
                    push(Frame {
                        pc: regs.pc(),
                        sp: regs.get(A::SP).unwrap_or(0),
                        image: None,
                        method: UnwindMethod::Unknown,
                    });
                    return summary(1, TerminationReason::Failed);
                }
            },
        };

        let mut state = WalkState {
            memory,
            mode,
            steps: 0,
        };
        let mut regs = *regs;
        let mut frame_count = 0;
        loop {
            let pc = regs.pc();
            let sp = regs.get(A::SP).unwrap_or(0);
            let is_first_frame = frame_count == 0;
            let region = snapshot.resolve(A::lookup_address(pc, is_first_frame));
            let (step, method) = self.step_frame(&mut state, &regs, region, is_first_frame);
            push(Frame {
                pc,
                sp,
                image: region.and_then(MappedRegion::image).cloned(),
                method,
            });
            frame_count += 1;

            let reason = match step {
                Step::Caller(caller) => {
                    let caller_sp = caller.get(A::SP).unwrap_or(0);
                    if caller.pc() == pc && caller_sp == sp {
                        TerminationReason::RepeatedFrame
                    } else if frame_count >= limit {
                        TerminationReason::Truncated
                    } else if !is_code(&snapshot, A::lookup_address(caller.pc(), false)) {
                        TerminationReason::Complete
                    } else {
                        regs = caller;
                        continue;
                    }
                }
                Step::Outermost => TerminationReason::Complete,
                Step::Failed => TerminationReason::Failed,
                Step::OutOfSteps => TerminationReason::Truncated,
            };
            if mode == UnwindMode::Normal {
                tracing::debug!("Walk ended after {frame_count} frames: {reason:?}");
            }
            return summary(frame_count, reason);
        }
    }

    fn step_frame(
        &self,
        state: &mut WalkState<'_>,
        regs: &RegisterSnapshot,
        region: Option<&MappedRegion>,
        is_first_frame: bool,
    ) -> (Step, UnwindMethod) {
        for method in STRATEGIES {
            if !self.is_enabled(method, state.mode) {
                continue;
            }
            if state.steps >= self.config.max_steps {
                return (Step::OutOfSteps, UnwindMethod::Unknown);
            }
            state.steps += 1;
            let result = match method {
                UnwindMethod::Quicken => self.try_quicken(state, regs, region, is_first_frame),
                UnwindMethod::FullDwarf => self.try_full_dwarf(state, regs, region, is_first_frame),
                UnwindMethod::FramePointer => A::unwind_frame_pointer(regs, state.memory),
                UnwindMethod::Ehabi => self.try_ehabi(state, regs, region, is_first_frame),
                UnwindMethod::Unknown => Err(StepError::NoCoverage),
            };
            match result {
                Ok(Some(caller)) => return (Step::Caller(caller), method),
                Ok(None) => return (Step::Outermost, method),
                Err(e) => {
                    if state.mode == UnwindMode::Normal {
                        tracing::debug!("{method:?} failed at pc 0x{:x}: {e}", regs.pc());
                    }
                }
            }
        }
        (Step::Failed, UnwindMethod::Unknown)
    }

    fn is_enabled(&self, method: UnwindMethod, mode: UnwindMode) -> bool {
        match method {
            UnwindMethod::Quicken => true,
            UnwindMethod::FullDwarf => self.config.enable_full_dwarf && mode == UnwindMode::Normal,
            UnwindMethod::FramePointer => self.config.enable_frame_pointer,
            UnwindMethod::Ehabi => self.config.enable_ehabi && A::KIND == ArchKind::Arm,
            UnwindMethod::Unknown => false,
        }
    }

    fn try_quicken(
        &self,
        state: &WalkState<'_>,
        regs: &RegisterSnapshot,
        region: Option<&MappedRegion>,
        is_first_frame: bool,
    ) -> Result<Option<RegisterSnapshot>, StepError> {
        let region = region.ok_or(StepError::NoCoverage)?;
        let image = region.image().ok_or(StepError::NoCoverage)?;
        let program = match state.mode {
            UnwindMode::Normal => self.program_for(image),
            UnwindMode::FastPathOnly if image.sections().is_none() => None,
            UnwindMode::FastPathOnly => match self.cache.try_get(image.identity()) {
                Some(program) => Some(program),
                None => {
                    self.defer(image);
                    return Err(StepError::NotCached);
                }
            },
        };
        let program = program.ok_or(StepError::NoCoverage)?;
        let svma = relative_address::<A>(region, regs.pc(), is_first_frame);
        interpreter::step::<A>(&program, svma, regs, state.memory)
    }

    fn try_full_dwarf(
        &self,
        state: &WalkState<'_>,
        regs: &RegisterSnapshot,
        region: Option<&MappedRegion>,
        is_first_frame: bool,
    ) -> Result<Option<RegisterSnapshot>, StepError> {
        let region = region.ok_or(StepError::NoCoverage)?;
        let sections = region
            .image()
            .and_then(|image| image.sections())
            .ok_or(StepError::NoCoverage)?;
        let svma = relative_address::<A>(region, regs.pc(), is_first_frame);
        dwarf::step::<A>(sections, svma, regs, state.memory)
    }

    fn try_ehabi(
        &self,
        state: &WalkState<'_>,
        regs: &RegisterSnapshot,
        region: Option<&MappedRegion>,
        is_first_frame: bool,
    ) -> Result<Option<RegisterSnapshot>, StepError> {
        let region = region.ok_or(StepError::NoCoverage)?;
        let sections = region
            .image()
            .and_then(|image| image.sections())
            .ok_or(StepError::NoCoverage)?;
        let svma = relative_address::<A>(region, regs.pc(), is_first_frame);
        let mut code = ArrayVec::<u8, { exidx::MAX_ENCODED_LEN }>::new();
        exidx::instructions_for_address(sections, svma, &mut code).map_err(|e| match e {
            exidx::EhabiError::NoCoverage | exidx::EhabiError::Malformed => StepError::NoCoverage,
            exidx::EhabiError::Unsupported => StepError::Unsupported,
        })?;
        interpreter::execute::<A>(&code, regs, state.memory)
    }
}

fn relative_address<A: Arch>(region: &MappedRegion, pc: u64, is_first_frame: bool) -> u64 {
    A::lookup_address(pc, is_first_frame).wrapping_sub(region.load_bias())
}

fn is_code(snapshot: &MapsSnapshot, address: u64) -> bool {
    snapshot
        .resolve(address)
        .map_or(false, MappedRegion::is_executable)
}
