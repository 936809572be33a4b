use std::sync::Arc;

use crate::display_utils::HexNum;
use crate::identity::BinaryIdentity;
use crate::maps::Image;

/// How the caller of a frame was recovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UnwindMethod {
    /// A compiled program from the [`QutCache`](crate::QutCache).
    Quicken,
    /// Direct evaluation of the image's DWARF CFI.
    FullDwarf,
    /// The frame pointer chain.
    FramePointer,
    /// The ARM exception index table, evaluated on demand.
    Ehabi,
    /// No strategy was run for this frame, because the walk ended here.
    #[default]
    Unknown,
}

/// Why a walk stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationReason {
    /// The outermost frame was reached, or the next return address is not in
    /// executable memory.
    Complete,
    /// The frame or step budget ran out.
    Truncated,
    /// A step produced the same (pc, sp) pair as the frame it started from.
    RepeatedFrame,
    /// The unwinder cannot read registers of this architecture.
    UnsupportedArchitecture,
    /// Every enabled strategy failed for the last frame.
    Failed,
}

/// One frame of an unwound stack.
#[derive(Clone, Default)]
pub struct Frame {
    pub pc: u64,
    pub sp: u64,
    /// The image containing `pc`, if it is mapped from a file.
    pub image: Option<Arc<Image>>,
    /// How this frame's caller was found.
    pub method: UnwindMethod,
}

impl Frame {
    pub fn identity(&self) -> Option<&BinaryIdentity> {
        self.image.as_deref().map(Image::identity)
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("pc", &HexNum(self.pc))
            .field("sp", &HexNum(self.sp))
            .field("identity", &self.identity())
            .field("method", &self.method)
            .finish()
    }
}

/// The frames of one walk, innermost first.
#[derive(Debug, Clone)]
pub struct UnwindResult {
    pub frames: Vec<Frame>,
    pub reason: TerminationReason,
}

/// The outcome of a walk into a caller-provided buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkSummary {
    /// How many entries at the start of the buffer were written.
    pub frame_count: usize,
    pub reason: TerminationReason,
}
