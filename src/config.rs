use std::path::PathBuf;
use std::time::Duration;

use crate::stats::StatisticsHook;

const DEFAULT_MAX_FRAMES: usize = 256;
const DEFAULT_REMOTE_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_DISK_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Options for an [`Unwinder`](crate::Unwinder).
///
/// ```
/// use quicken_unwind::UnwinderConfig;
///
/// let config = UnwinderConfig::default()
///     .with_max_frames(64)
///     .with_frame_pointer(false);
/// assert_eq!(config.max_steps, 256);
/// ```
#[derive(Clone)]
pub struct UnwinderConfig {
    /// The maximum number of frames in one walk.
    pub max_frames: usize,
    /// The maximum number of strategy attempts in one walk, across all
    /// frames. Bounds the work done on a corrupted stack.
    pub max_steps: usize,
    /// Where compiled programs are persisted. No disk store if `None`.
    pub cache_dir: Option<PathBuf>,
    pub remote_chunk_size: usize,
    pub enable_full_dwarf: bool,
    pub enable_frame_pointer: bool,
    pub enable_ehabi: bool,
    /// Persisted programs unused for longer than this are garbage collected.
    pub disk_max_age: Duration,
    pub stats_hook: Option<StatisticsHook>,
}

impl Default for UnwinderConfig {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            max_steps: 4 * DEFAULT_MAX_FRAMES,
            cache_dir: None,
            remote_chunk_size: DEFAULT_REMOTE_CHUNK_SIZE,
            enable_full_dwarf: true,
            enable_frame_pointer: true,
            enable_ehabi: true,
            disk_max_age: DEFAULT_DISK_MAX_AGE,
            stats_hook: None,
        }
    }
}

impl UnwinderConfig {
    /// Sets the frame limit. The step limit follows at four steps per frame.
    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self.max_steps = max_frames.saturating_mul(4);
        self
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    pub fn with_remote_chunk_size(mut self, chunk_size: usize) -> Self {
        self.remote_chunk_size = chunk_size;
        self
    }

    pub fn with_full_dwarf(mut self, enabled: bool) -> Self {
        self.enable_full_dwarf = enabled;
        self
    }

    pub fn with_frame_pointer(mut self, enabled: bool) -> Self {
        self.enable_frame_pointer = enabled;
        self
    }

    pub fn with_ehabi(mut self, enabled: bool) -> Self {
        self.enable_ehabi = enabled;
        self
    }

    pub fn with_disk_max_age(mut self, max_age: Duration) -> Self {
        self.disk_max_age = max_age;
        self
    }

    pub fn with_stats_hook(mut self, hook: StatisticsHook) -> Self {
        self.stats_hook = Some(hook);
        self
    }
}

impl std::fmt::Debug for UnwinderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnwinderConfig")
            .field("max_frames", &self.max_frames)
            .field("max_steps", &self.max_steps)
            .field("cache_dir", &self.cache_dir)
            .field("remote_chunk_size", &self.remote_chunk_size)
            .field("enable_full_dwarf", &self.enable_full_dwarf)
            .field("enable_frame_pointer", &self.enable_frame_pointer)
            .field("enable_ehabi", &self.enable_ehabi)
            .field("disk_max_age", &self.disk_max_age)
            .field("stats_hook", &self.stats_hook.is_some())
            .finish()
    }
}
