use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::arch::ArchKind;
use crate::error::CompileError;
use crate::identity::BinaryIdentity;
use crate::qut::UnwindProgram;
use crate::store::DiskStore;

type Slot = Arc<OnceCell<Arc<UnwindProgram>>>;

/// The in-memory map of compiled programs, backed by an optional
/// [`DiskStore`].
///
/// Each identity gets a slot that is initialized at most once, so concurrent
/// requests for the same missing program trigger a single load or compile
/// and all receive the same `Arc`. The map lock is only held to find or
/// insert a slot, never while building.
pub struct QutCache {
    arch: ArchKind,
    programs: Mutex<HashMap<BinaryIdentity, Slot>>,
    disk: Option<Arc<DiskStore>>,
    writer: Mutex<Option<BackgroundWriter>>,
    compile_count: AtomicU64,
}

impl QutCache {
    pub fn new(arch: ArchKind, disk: Option<DiskStore>) -> Self {
        Self {
            arch,
            programs: Mutex::new(HashMap::new()),
            disk: disk.map(Arc::new),
            writer: Mutex::new(None),
            compile_count: AtomicU64::new(0),
        }
    }

    pub fn arch(&self) -> ArchKind {
        self.arch
    }

    pub fn disk(&self) -> Option<&DiskStore> {
        self.disk.as_deref()
    }

    /// Returns the program for `identity`, loading it from disk or calling
    /// `compile` if it is not in memory yet.
    ///
    /// This may block on disk I/O, on compilation, or on another thread that
    /// is building the same program. A failed compile yields an empty
    /// program, which makes callers fall back to other strategies.
    pub fn get_or_build<F>(&self, identity: &BinaryIdentity, compile: F) -> Arc<UnwindProgram>
    where
        F: FnOnce() -> Result<UnwindProgram, CompileError>,
    {
        let slot = self
            .programs
            .lock()
            .entry(identity.clone())
            .or_default()
            .clone();
        let mut built = None;
        let program = slot
            .get_or_init(|| {
                let (program, compiled) = self.load_or_compile(identity, compile);
                if compiled {
                    built = Some(program.clone());
                }
                program
            })
            .clone();
        // The program is published; persisting it is best effort.
        if let Some(program) = built {
            self.persist(program);
        }
        program
    }

    /// Returns the program for `identity` if it has already been built.
    /// Never blocks and never allocates: if the map is locked by another
    /// thread (or by the interrupted code on this thread), this is a miss.
    pub fn try_get(&self, identity: &BinaryIdentity) -> Option<Arc<UnwindProgram>> {
        let programs = self.programs.try_lock()?;
        programs.get(identity)?.get().cloned()
    }

    /// Drops the program for `identity` from memory and marks its persisted
    /// copy for eviction. Holders of the program keep a valid, stale copy.
    pub fn invalidate(&self, identity: &BinaryIdentity) {
        let slot = self.programs.lock().remove(identity);
        if let Some(program) = slot.as_ref().and_then(|slot| slot.get()) {
            program.mark_stale();
        }
        if let Some(disk) = &self.disk {
            disk.mark_evictable(identity);
        }
        tracing::debug!("Invalidated the program for {identity}");
    }

    /// Waits until all scheduled disk writes have completed.
    pub fn flush(&self) {
        let writer = self.writer.lock();
        if let Some(writer) = writer.as_ref() {
            writer.flush();
        }
    }

    /// The number of programs currently in memory.
    pub fn len(&self) -> usize {
        self.programs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How often a compile was started since this cache was created.
    pub fn compile_count(&self) -> u64 {
        self.compile_count.load(Ordering::Relaxed)
    }

    /// Holds the map lock, as an interrupted builder on this thread would.
    #[cfg(test)]
    pub(crate) fn lock_map(&self) -> parking_lot::MutexGuard<'_, HashMap<BinaryIdentity, Slot>> {
        self.programs.lock()
    }

    fn load_or_compile<F>(&self, identity: &BinaryIdentity, compile: F) -> (Arc<UnwindProgram>, bool)
    where
        F: FnOnce() -> Result<UnwindProgram, CompileError>,
    {
        if let Some(disk) = &self.disk {
            match disk.load(identity) {
                Ok(Some(program)) => {
                    tracing::debug!("Disk cache hit for {identity}");
                    return (Arc::new(program), false);
                }
                Ok(None) => tracing::debug!("Disk cache miss for {identity}"),
                Err(e) => tracing::info!("Persisted program for {identity} is unusable: {e}"),
            }
        }
        self.compile_count.fetch_add(1, Ordering::Relaxed);
        match compile() {
            Ok(program) => (Arc::new(program), true),
            Err(e) => {
                tracing::warn!("Could not compile unwind information for {identity}: {e}");
                (Arc::new(UnwindProgram::empty(identity.clone(), self.arch)), false)
            }
        }
    }

    fn persist(&self, program: Arc<UnwindProgram>) {
        let Some(disk) = &self.disk else {
            return;
        };
        let mut writer = self.writer.lock();
        if writer.is_none() {
            match BackgroundWriter::spawn(disk.clone()) {
                Ok(spawned) => *writer = Some(spawned),
                Err(e) => {
                    tracing::warn!("Could not start the cache writer thread: {e}");
                    if let Err(e) = disk.store(&program) {
                        tracing::warn!("Could not persist {}: {e}", program.identity());
                    }
                    return;
                }
            }
        }
        if let Some(writer) = writer.as_ref() {
            writer.send(WriterMessage::Store(program));
        }
    }
}

impl Drop for QutCache {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.get_mut().take() {
            writer.shutdown();
        }
    }
}

enum WriterMessage {
    Store(Arc<UnwindProgram>),
    Flush(mpsc::SyncSender<()>),
}

/// A thread that writes programs to the disk store in the order they were
/// built.
struct BackgroundWriter {
    sender: mpsc::Sender<WriterMessage>,
    thread: JoinHandle<()>,
}

impl BackgroundWriter {
    fn spawn(disk: Arc<DiskStore>) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name("qut-writer".to_string())
            .spawn(move || {
                for message in receiver {
                    match message {
                        WriterMessage::Store(program) => {
                            if let Err(e) = disk.store(&program) {
                                tracing::warn!("Could not persist {}: {e}", program.identity());
                            }
                        }
                        WriterMessage::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })?;
        Ok(Self { sender, thread })
    }

    fn send(&self, message: WriterMessage) {
        if self.sender.send(message).is_err() {
            tracing::warn!("The cache writer thread has exited");
        }
    }

    fn flush(&self) {
        let (done, wait) = mpsc::sync_channel(1);
        self.send(WriterMessage::Flush(done));
        let _ = wait.recv();
    }

    fn shutdown(self) {
        drop(self.sender);
        if self.thread.join().is_err() {
            tracing::warn!("The cache writer thread panicked");
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Barrier;
    use std::time::Duration;

    use super::*;
    use crate::identity::BuildId;
    use crate::qut::ProgramBuilder;

    fn identity(name: &str) -> BinaryIdentity {
        BinaryIdentity::new(format!("/lib/{name}"), BuildId::Embedded(name.as_bytes().to_vec()), 10)
    }

    fn compiled(identity: &BinaryIdentity) -> Result<UnwindProgram, CompileError> {
        let mut builder = ProgramBuilder::new();
        builder.push(0x10..0x20, &[0x01, 0x41, 0xff]);
        Ok(builder.finish(identity.clone(), ArchKind::X86_64))
    }

    #[test]
    fn test_concurrent_requests_compile_once() {
        let cache = QutCache::new(ArchKind::X86_64, None);
        let id = identity("libconcurrent.so");
        let threads = 8;
        let barrier = Barrier::new(threads);
        let programs: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        cache.get_or_build(&id, || {
                            std::thread::sleep(Duration::from_millis(50));
                            compiled(&id)
                        })
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(cache.compile_count(), 1);
        for program in &programs {
            assert!(Arc::ptr_eq(program, &programs[0]));
        }
    }

    #[test]
    fn test_try_get_never_blocks() {
        let cache = QutCache::new(ArchKind::X86_64, None);
        let id = identity("libtry.so");
        assert!(cache.try_get(&id).is_none());
        let program = cache.get_or_build(&id, || compiled(&id));
        assert!(Arc::ptr_eq(&cache.try_get(&id).unwrap(), &program));

        let _guard = cache.programs.lock();
        assert!(cache.try_get(&id).is_none());
    }

    #[test]
    fn test_compile_failure_yields_empty_program() {
        let cache = QutCache::new(ArchKind::X86_64, None);
        let id = identity("libbroken.so");
        let program = cache.get_or_build(&id, || Err(CompileError::BigEndian));
        assert!(program.is_empty());
        // The failure is remembered.
        let again = cache.get_or_build(&id, || compiled(&id));
        assert!(again.is_empty());
        assert_eq!(cache.compile_count(), 1);
    }

    #[test]
    fn test_invalidate_keeps_holders_valid() {
        let cache = QutCache::new(ArchKind::X86_64, None);
        let id = identity("libgone.so");
        let program = cache.get_or_build(&id, || compiled(&id));
        cache.invalidate(&id);
        assert!(program.is_stale());
        assert!(program.lookup(0x10).is_some());
        assert!(cache.try_get(&id).is_none());
        let rebuilt = cache.get_or_build(&id, || compiled(&id));
        assert!(!Arc::ptr_eq(&program, &rebuilt));
        assert_eq!(cache.compile_count(), 2);
    }

    #[test]
    fn test_disk_store_is_consulted_first() {
        let dir = tempfile::tempdir().unwrap();
        let id = identity("libdisk.so");
        let disk = || DiskStore::new(dir.path(), ArchKind::X86_64, Duration::from_secs(60)).unwrap();

        let cache = QutCache::new(ArchKind::X86_64, Some(disk()));
        cache.get_or_build(&id, || compiled(&id));
        cache.flush();
        assert!(cache.disk().unwrap().path_for(&id).exists());
        drop(cache);

        let cache = QutCache::new(ArchKind::X86_64, Some(disk()));
        let program = cache.get_or_build(&id, || panic!("should have been loaded from disk"));
        assert_eq!(program.len(), 1);
        assert_eq!(cache.compile_count(), 0);
    }
}
