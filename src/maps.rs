use std::collections::HashMap;
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};

use crate::display_utils::HexNum;
use crate::error::MapsError;
use crate::identity::{BinaryIdentity, BuildId};
use crate::sections::{ImageBytes, UnwindSections};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        const READ = 0b00001;
        const WRITE = 0b00010;
        const EXECUTE = 0b00100;
        const SHARED = 0b01000;
        const PRIVATE = 0b10000;
    }
}

/// A binary image that is mapped into the address space.
pub struct Image {
    identity: BinaryIdentity,
    sections: Option<Arc<UnwindSections>>,
}

impl Image {
    pub fn new(identity: BinaryIdentity, sections: Option<UnwindSections>) -> Arc<Self> {
        Arc::new(Self {
            identity,
            sections: sections.map(Arc::new),
        })
    }

    /// Opens and maps the image whose ELF header is at `elf_offset` in the
    /// file at `path`. Images that cannot be read or parsed still get an
    /// identity, but no sections.
    ///
    /// An image embedded in a larger file (a library stored uncompressed in
    /// an APK) is named `<file>!0x<offset>`.
    pub fn load(path: &Path, elf_offset: u64) -> Arc<Self> {
        let name = if elf_offset == 0 {
            path.to_owned()
        } else {
            let mut name = path.as_os_str().to_owned();
            name.push(format!("!0x{elf_offset:x}"));
            PathBuf::from(name)
        };
        let mapped = map_image_file(path).and_then(|(mmap, mtime)| {
            let start = usize::try_from(elf_offset)
                .ok()
                .filter(|start| *start < mmap.len())
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof))?;
            Ok((mmap, start, mtime))
        });
        let (identity, sections) = match mapped {
            Ok((mmap, start, mtime)) => {
                let bytes = ImageBytes::Mapped {
                    mmap: Arc::new(mmap),
                    start,
                };
                let identity = BinaryIdentity::for_image_data(&name, &bytes, mtime);
                let sections = match UnwindSections::from_object(bytes) {
                    Ok(sections) => Some(sections),
                    Err(e) => {
                        tracing::debug!("No unwind sections for {}: {e}", name.display());
                        None
                    }
                };
                (identity, sections)
            }
            Err(e) => {
                tracing::debug!("Could not map {}: {e}", name.display());
                let build_id = BuildId::derived(&name, 0, UNIX_EPOCH);
                (BinaryIdentity::new(name, build_id, 0), None)
            }
        };
        Self::new(identity, sections)
    }

    pub fn identity(&self) -> &BinaryIdentity {
        &self.identity
    }

    pub fn sections(&self) -> Option<&Arc<UnwindSections>> {
        self.sections.as_ref()
    }
}

fn map_image_file(path: &Path) -> std::io::Result<(memmap2::Mmap, std::time::SystemTime)> {
    let file = File::open(path)?;
    let mtime = file.metadata()?.modified().unwrap_or(UNIX_EPOCH);
    // SAFETY: the mapping is read-only. Images that are modified while mapped
    // would also break the process that loaded them.
    let mmap = unsafe { memmap2::Mmap::map(&file)? };
    Ok((mmap, mtime))
}

/// One contiguous mapping of the target's address space.
#[derive(Clone)]
pub struct MappedRegion {
    start: u64,
    end: u64,
    offset: u64,
    elf_offset: u64,
    permissions: Permissions,
    path: Option<PathBuf>,
    load_bias: u64,
    image: Option<Arc<Image>>,
}

impl MappedRegion {
    pub fn new(range: Range<u64>, offset: u64, permissions: Permissions, path: Option<PathBuf>) -> Self {
        Self {
            start: range.start,
            end: range.end,
            offset,
            elf_offset: 0,
            permissions,
            path,
            load_bias: range.start.wrapping_sub(offset),
            image: None,
        }
    }

    /// Sets the file offset of the ELF header of the image this region maps.
    /// Must be called before [`MappedRegion::with_image`].
    pub fn with_elf_offset(mut self, elf_offset: u64) -> Self {
        self.elf_offset = elf_offset;
        self.load_bias = self.start.wrapping_sub(self.offset.wrapping_sub(elf_offset));
        self
    }

    /// Attaches the image backing this region, computing the load bias from
    /// the image's segments when they are known.
    pub fn with_image(mut self, image: Arc<Image>) -> Self {
        if let Some(sections) = image.sections() {
            let offset_in_image = self.offset.wrapping_sub(self.elf_offset);
            self.load_bias = sections.load_bias(self.start, offset_in_image);
        }
        self.image = Some(image);
        self
    }

    pub fn with_load_bias(mut self, load_bias: u64) -> Self {
        self.load_bias = load_bias;
        self
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The file offset of the ELF header. Nonzero for libraries mapped
    /// straight out of an archive.
    pub fn elf_offset(&self) -> u64 {
        self.elf_offset
    }

    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    pub fn image(&self) -> Option<&Arc<Image>> {
        self.image.as_ref()
    }

    pub fn identity(&self) -> Option<&BinaryIdentity> {
        self.image.as_deref().map(Image::identity)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.start <= address && address < self.end
    }

    pub fn is_executable(&self) -> bool {
        self.permissions.contains(Permissions::EXECUTE)
    }
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("start", &HexNum(self.start))
            .field("end", &HexNum(self.end))
            .field("offset", &HexNum(self.offset))
            .field("elf_offset", &HexNum(self.elf_offset))
            .field("permissions", &self.permissions)
            .field("path", &self.path)
            .field("load_bias", &HexNum(self.load_bias))
            .finish()
    }
}

/// An immutable, sorted and disjoint view of the address space.
#[derive(Debug)]
pub struct MapsSnapshot {
    generation: u64,
    regions: Vec<MappedRegion>,
}

impl MapsSnapshot {
    fn new(generation: u64, mut regions: Vec<MappedRegion>) -> Self {
        regions.sort_by_key(|r| r.start);
        let mut disjoint: Vec<MappedRegion> = Vec::with_capacity(regions.len());
        for region in regions {
            if region.start >= region.end {
                continue;
            }
            if let Some(last) = disjoint.last() {
                if region.start < last.end {
                    tracing::warn!("Dropping overlapping region {region:?}");
                    continue;
                }
            }
            disjoint.push(region);
        }
        Self {
            generation,
            regions: disjoint,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn regions(&self) -> &[MappedRegion] {
        &self.regions
    }

    /// Finds the region containing `address`.
    pub fn resolve(&self, address: u64) -> Option<&MappedRegion> {
        let index = self.regions.partition_point(|r| r.start <= address);
        let region = self.regions.get(index.checked_sub(1)?)?;
        region.contains(address).then_some(region)
    }

    fn identities(&self) -> impl Iterator<Item = &BinaryIdentity> {
        self.regions.iter().filter_map(MappedRegion::identity)
    }
}

enum MapsSource {
    Process(libc::pid_t),
    Fixed,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ImageKey {
    path: PathBuf,
    inode: u64,
    elf_offset: u64,
}

/// The mapped regions of one process.
///
/// The current [`MapsSnapshot`] is published behind a shared handle. Refreshes
/// build a complete new snapshot and swap the handle, so readers holding the
/// previous snapshot keep a consistent view.
pub struct AddressSpace {
    source: MapsSource,
    current: RwLock<Arc<MapsSnapshot>>,
    dirty: AtomicBool,
    generation: AtomicU64,
    images: Mutex<HashMap<ImageKey, Arc<Image>>>,
    unloaded: Mutex<Vec<BinaryIdentity>>,
}

impl AddressSpace {
    /// The address space of the current process.
    pub fn for_self() -> Self {
        // SAFETY: getpid has no preconditions.
        Self::for_process(unsafe { libc::getpid() })
    }

    /// The address space of process `pid`, read from `/proc/<pid>/maps`. The
    /// regions are read lazily on the first snapshot.
    pub fn for_process(pid: i32) -> Self {
        Self {
            source: MapsSource::Process(pid),
            current: RwLock::new(Arc::new(MapsSnapshot::new(0, Vec::new()))),
            dirty: AtomicBool::new(true),
            generation: AtomicU64::new(0),
            images: Mutex::new(HashMap::new()),
            unloaded: Mutex::new(Vec::new()),
        }
    }

    /// An address space with a fixed list of regions, for captured samples
    /// and tests.
    pub fn from_regions(regions: Vec<MappedRegion>) -> Self {
        Self {
            source: MapsSource::Fixed,
            current: RwLock::new(Arc::new(MapsSnapshot::new(1, regions))),
            dirty: AtomicBool::new(false),
            generation: AtomicU64::new(1),
            images: Mutex::new(HashMap::new()),
            unloaded: Mutex::new(Vec::new()),
        }
    }

    /// The current snapshot, refreshed first if a maps change was notified.
    pub fn snapshot(&self) -> Arc<MapsSnapshot> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            if let Err(e) = self.refresh() {
                tracing::warn!("Refreshing the address space failed: {e}");
                self.dirty.store(true, Ordering::Release);
            }
        }
        self.current.read().clone()
    }

    /// The current snapshot without refreshing and without waiting for a
    /// concurrent publisher. Safe to call from a signal handler.
    pub fn try_snapshot(&self) -> Option<Arc<MapsSnapshot>> {
        self.current.try_read().map(|current| current.clone())
    }

    /// Resolves `address` to its region and the identity of the image that
    /// backs it. Addresses in anonymous or unmapped memory resolve to `None`.
    pub fn resolve(&self, address: u64) -> Option<(MappedRegion, BinaryIdentity)> {
        let snapshot = self.snapshot();
        let region = snapshot.resolve(address)?;
        let identity = region.identity()?.clone();
        Some((region.clone(), identity))
    }

    /// Marks the current snapshot as outdated. Must be called after any
    /// module load or unload.
    pub fn notify_maps_changed(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Replaces the regions of a fixed address space.
    pub fn replace_regions(&self, regions: Vec<MappedRegion>) {
        self.publish(regions);
    }

    /// Returns the identities of images that disappeared in refreshes since
    /// the last call.
    pub fn take_unloaded(&self) -> Vec<BinaryIdentity> {
        std::mem::take(&mut *self.unloaded.lock())
    }

    fn refresh(&self) -> Result<(), MapsError> {
        let pid = match self.source {
            MapsSource::Process(pid) => pid,
            MapsSource::Fixed => return Ok(()),
        };
        let path = PathBuf::from(format!("/proc/{pid}/maps"));
        let contents = std::fs::read_to_string(&path).map_err(|source| MapsError::Io {
            path: path.clone(),
            source,
        })?;
        let mappings = parse_maps(&contents)?;
        let regions = self.attach_images(&mappings);

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = MapsSnapshot::new(generation, regions);
        tracing::debug!(
            "Address space of pid {pid} refreshed: {} regions, generation {generation}",
            snapshot.regions.len()
        );
        *self.current.write() = Arc::new(snapshot);
        Ok(())
    }

    /// Turns parsed mappings into regions, reusing the images of the previous
    /// refresh and recording the ones that are gone.
    fn attach_images(&self, mappings: &[RawMapping]) -> Vec<MappedRegion> {
        let mut images = self.images.lock();
        let mut retained = HashMap::new();
        let mut regions = Vec::with_capacity(mappings.len());
        for (index, mapping) in mappings.iter().enumerate() {
            let mut region = MappedRegion::new(
                mapping.range.clone(),
                mapping.offset,
                mapping.permissions,
                mapping.path.clone(),
            );
            let image_path = mapping.path.as_ref().filter(|p| p.is_absolute());
            if let (Some(image_path), true) = (image_path, region.is_executable()) {
                let previous = index.checked_sub(1).and_then(|i| mappings.get(i));
                let key = ImageKey {
                    path: image_path.clone(),
                    inode: mapping.inode,
                    elf_offset: elf_start_offset(mapping, previous),
                };
                let image = match images.get(&key).or_else(|| retained.get(&key)) {
                    Some(image) => Arc::clone(image),
                    None => Image::load(&key.path, key.elf_offset),
                };
                region = region.with_elf_offset(key.elf_offset).with_image(Arc::clone(&image));
                retained.insert(key, image);
            }
            regions.push(region);
        }
        let mut unloaded = self.unloaded.lock();
        for (key, image) in images.iter() {
            if !retained.contains_key(key) {
                unloaded.push(image.identity().clone());
            }
        }
        *images = retained;
        regions
    }

    fn publish(&self, regions: Vec<MappedRegion>) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let snapshot = MapsSnapshot::new(generation, regions);
        let previous = std::mem::replace(&mut *self.current.write(), Arc::new(snapshot));
        let current = self.current.read().clone();
        let mut unloaded = self.unloaded.lock();
        for identity in previous.identities() {
            if !current.identities().any(|i| i == identity) && !unloaded.contains(identity) {
                unloaded.push(identity.clone());
            }
        }
    }
}

/// Finds the file offset of the ELF header for an executable mapping.
///
/// Normal libraries are mapped from the start of their file. A library loaded
/// straight from an APK starts somewhere inside the archive: its header is
/// either at the start of this mapping or at the start of the read-only
/// mapping of the same file right before it.
fn elf_start_offset(mapping: &RawMapping, previous: Option<&RawMapping>) -> u64 {
    let Some(path) = mapping.path.as_deref() else {
        return 0;
    };
    if mapping.offset == 0 {
        return 0;
    }
    if has_elf_magic(path, mapping.offset) {
        return mapping.offset;
    }
    let previous = previous.filter(|previous| {
        previous.path.as_deref() == Some(path)
            && previous.offset < mapping.offset
            && !previous.permissions.contains(Permissions::EXECUTE)
    });
    match previous {
        Some(previous) if previous.offset != 0 && has_elf_magic(path, previous.offset) => {
            previous.offset
        }
        _ => 0,
    }
}

fn has_elf_magic(path: &Path, offset: u64) -> bool {
    use std::os::unix::fs::FileExt;

    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|file| file.read_exact_at(&mut magic, offset))
        .is_ok()
        && magic == *b"\x7fELF"
}

/// One parsed line of `/proc/<pid>/maps`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMapping {
    pub range: Range<u64>,
    pub permissions: Permissions,
    pub offset: u64,
    pub inode: u64,
    pub path: Option<PathBuf>,
}

/// Parses the contents of a `/proc/<pid>/maps` file, sorted by start address.
pub fn parse_maps(contents: &str) -> Result<Vec<RawMapping>, MapsError> {
    let mut mappings = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        mappings.push(parse_maps_line(line).map_err(|reason| MapsError::Format {
            line: index + 1,
            reason,
        })?);
    }
    mappings.sort_by_key(|m| m.range.start);
    Ok(mappings)
}

fn parse_maps_line(line: &str) -> Result<RawMapping, &'static str> {
    // The path is the last field and may contain spaces, so the fields are
    // split off one at a time.
    fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
        let trimmed = rest.trim_start();
        if trimmed.is_empty() {
            return None;
        }
        let (field, remainder) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        *rest = remainder;
        Some(field)
    }

    let mut rest = line;
    let range = next_field(&mut rest).ok_or("missing range")?;
    let (start, end) = range.split_once('-').ok_or("bad range")?;
    let start = u64::from_str_radix(start, 16).map_err(|_| "bad range start")?;
    let end = u64::from_str_radix(end, 16).map_err(|_| "bad range end")?;

    let mut permissions = Permissions::empty();
    for ch in next_field(&mut rest).ok_or("missing permissions")?.chars() {
        match ch {
            'r' => permissions.insert(Permissions::READ),
            'w' => permissions.insert(Permissions::WRITE),
            'x' => permissions.insert(Permissions::EXECUTE),
            's' => permissions.insert(Permissions::SHARED),
            'p' => permissions.insert(Permissions::PRIVATE),
            _ => {}
        }
    }

    let offset = next_field(&mut rest).ok_or("missing offset")?;
    let offset = u64::from_str_radix(offset, 16).map_err(|_| "bad offset")?;
    let _dev = next_field(&mut rest).ok_or("missing device")?;
    let inode = next_field(&mut rest).ok_or("missing inode")?;
    let inode = inode.parse::<u64>().map_err(|_| "bad inode")?;

    let path = rest.trim_start();
    let path = path.strip_suffix(" (deleted)").unwrap_or(path);
    let path = (!path.is_empty()).then(|| PathBuf::from(path));

    Ok(RawMapping {
        range: start..end,
        permissions,
        offset,
        inode,
        path,
    })
}
