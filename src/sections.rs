use std::ops::{Deref, Range};
use std::sync::Arc;

use object::{CompressionFormat, Object, ObjectSection, ObjectSegment, SectionKind};

use crate::arch::ArchKind;
use crate::error::CompileError;

/// The bytes of a binary image, either memory-mapped from its file or owned.
///
/// A mapped image may start inside its file: libraries loaded straight from
/// an APK begin at a nonzero offset of the archive.
#[derive(Clone)]
pub enum ImageBytes {
    Mapped { mmap: Arc<memmap2::Mmap>, start: usize },
    Owned(Arc<[u8]>),
}

impl Deref for ImageBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ImageBytes::Mapped { mmap, start } => mmap.get(*start..).unwrap_or_default(),
            ImageBytes::Owned(bytes) => bytes,
        }
    }
}

/// One section of an image: its bytes and its stated virtual memory address.
#[derive(Clone)]
pub struct SectionData {
    bytes: ImageBytes,
    range: Range<usize>,
    svma: u64,
}

impl SectionData {
    pub fn new(bytes: impl Into<Arc<[u8]>>, svma: u64) -> Self {
        let bytes: Arc<[u8]> = bytes.into();
        let range = 0..bytes.len();
        Self {
            bytes: ImageBytes::Owned(bytes),
            range,
            svma,
        }
    }

    pub fn data(&self) -> &[u8] {
        self.bytes.get(self.range.clone()).unwrap_or_default()
    }

    pub fn svma(&self) -> u64 {
        self.svma
    }

    pub fn svma_range(&self) -> Range<u64> {
        self.svma..self.svma + self.range.len() as u64
    }
}

/// A loadable segment, used to translate file offsets into load biases.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadSegment {
    pub svma: u64,
    pub file_offset: u64,
    pub file_size: u64,
}

/// The unwind-relevant sections of one image.
#[derive(Clone)]
pub struct UnwindSections {
    arch: ArchKind,
    pub(crate) eh_frame: Option<SectionData>,
    pub(crate) eh_frame_hdr: Option<SectionData>,
    pub(crate) debug_frame: Option<SectionData>,
    pub(crate) arm_exidx: Option<SectionData>,
    pub(crate) arm_extab: Option<SectionData>,
    text_svma: u64,
    got_svma: u64,
    code_end_svma: Option<u64>,
    segments: Vec<LoadSegment>,
}

impl UnwindSections {
    /// An image without any unwind sections.
    pub fn new(arch: ArchKind) -> Self {
        Self {
            arch,
            eh_frame: None,
            eh_frame_hdr: None,
            debug_frame: None,
            arm_exidx: None,
            arm_extab: None,
            text_svma: 0,
            got_svma: 0,
            code_end_svma: None,
            segments: Vec::new(),
        }
    }

    pub fn with_eh_frame(mut self, section: SectionData) -> Self {
        self.eh_frame = Some(section);
        self
    }

    pub fn with_eh_frame_hdr(mut self, section: SectionData) -> Self {
        self.eh_frame_hdr = Some(section);
        self
    }

    pub fn with_debug_frame(mut self, section: SectionData) -> Self {
        self.debug_frame = Some(section);
        self
    }

    pub fn with_arm_exidx(mut self, section: SectionData) -> Self {
        self.arm_exidx = Some(section);
        self
    }

    pub fn with_arm_extab(mut self, section: SectionData) -> Self {
        self.arm_extab = Some(section);
        self
    }

    pub fn with_text_range(mut self, range: Range<u64>) -> Self {
        self.text_svma = range.start;
        self.code_end_svma = Some(range.end);
        self
    }

    /// Extracts the unwind sections from an ELF image.
    pub fn from_object(bytes: ImageBytes) -> Result<Self, CompileError> {
        let file = object::File::parse(&*bytes)?;
        if !file.is_little_endian() {
            return Err(CompileError::BigEndian);
        }
        let arch = ArchKind::from_object(file.architecture())
            .ok_or(CompileError::UnsupportedArchitecture(file.architecture()))?;

        let section = |name: &str| -> Option<SectionData> {
            let section = file.section_by_name(name)?;
            let svma = section.address();
            let range = section.compressed_file_range().ok()?;
            if range.format == CompressionFormat::None {
                let start = usize::try_from(range.offset).ok()?;
                let end = start.checked_add(usize::try_from(range.uncompressed_size).ok()?)?;
                if end > bytes.len() {
                    return None;
                }
                Some(SectionData {
                    bytes: bytes.clone(),
                    range: start..end,
                    svma,
                })
            } else {
                let data = section.uncompressed_data().ok()?;
                Some(SectionData::new(data.into_owned(), svma))
            }
        };

        let mut sections = Self::new(arch);
        sections.eh_frame = section(".eh_frame");
        sections.eh_frame_hdr = section(".eh_frame_hdr");
        sections.debug_frame = section(".debug_frame");
        if sections.eh_frame.is_none() || sections.debug_frame.is_none() {
            let debug_data = file.section_by_name(".gnu_debugdata");
            if let Some(data) = debug_data.and_then(|section| section.data().ok()) {
                sections.add_mini_debug_info(data);
            }
        }
        sections.arm_exidx = section(".ARM.exidx");
        sections.arm_extab = section(".ARM.extab");
        sections.text_svma = file
            .section_by_name(".text")
            .map_or(0, |s| s.address());
        sections.got_svma = file.section_by_name(".got").map_or(0, |s| s.address());
        sections.code_end_svma = file
            .sections()
            .filter(|s| s.kind() == SectionKind::Text)
            .map(|s| s.address() + s.size())
            .max();
        sections.segments = file
            .segments()
            .map(|segment| {
                let (file_offset, file_size) = segment.file_range();
                LoadSegment {
                    svma: segment.address(),
                    file_offset,
                    file_size,
                }
            })
            .collect();
        Ok(sections)
    }

    /// Fills in missing CFI sections from the xz-compressed ELF image stored
    /// in `.gnu_debugdata` (MiniDebugInfo). Its addresses match the outer image.
    fn add_mini_debug_info(&mut self, compressed: &[u8]) {
        let mut decompressed = Vec::new();
        if let Err(e) = lzma_rs::xz_decompress(&mut &compressed[..], &mut decompressed) {
            tracing::debug!("Could not decompress .gnu_debugdata: {e}");
            return;
        }
        let Ok(inner) = object::File::parse(&decompressed[..]) else {
            tracing::debug!(".gnu_debugdata does not hold an ELF image");
            return;
        };
        let section = |name: &str| -> Option<SectionData> {
            let section = inner.section_by_name(name)?;
            let data = section.uncompressed_data().ok()?;
            Some(SectionData::new(data.into_owned(), section.address()))
        };
        if self.debug_frame.is_none() {
            self.debug_frame = section(".debug_frame");
        }
        if self.eh_frame.is_none() {
            self.eh_frame = section(".eh_frame");
            self.eh_frame_hdr = section(".eh_frame_hdr");
        }
    }

    pub fn arch(&self) -> ArchKind {
        self.arch
    }

    /// Whether the image has no unwind information at all.
    pub fn is_empty(&self) -> bool {
        self.eh_frame.is_none() && self.debug_frame.is_none() && self.arm_exidx.is_none()
    }

    /// The end of the image's executable code, if known.
    pub fn code_end_svma(&self) -> Option<u64> {
        self.code_end_svma
    }

    pub(crate) fn base_addresses(&self) -> gimli::BaseAddresses {
        gimli::BaseAddresses::default()
            .set_eh_frame(self.eh_frame.as_ref().map_or(0, SectionData::svma))
            .set_eh_frame_hdr(self.eh_frame_hdr.as_ref().map_or(0, SectionData::svma))
            .set_text(self.text_svma)
            .set_got(self.got_svma)
    }

    /// The load bias of a mapping of this image that starts at `region_start`
    /// and maps the file from `file_offset` onwards.
    pub fn load_bias(&self, region_start: u64, file_offset: u64) -> u64 {
        let segment = self.segments.iter().find(|segment| {
            file_offset >= segment.file_offset
                && file_offset < segment.file_offset + segment.file_size.max(1)
        });
        match segment {
            Some(segment) => {
                let svma = segment.svma + (file_offset - segment.file_offset);
                region_start.wrapping_sub(svma)
            }
            None => region_start.wrapping_sub(file_offset),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_load_bias_from_segments() {
        let mut sections = UnwindSections::new(ArchKind::Aarch64);
        sections.segments = vec![
            LoadSegment {
                svma: 0,
                file_offset: 0,
                file_size: 0x5000,
            },
            LoadSegment {
                svma: 0x15000,
                file_offset: 0x5000,
                file_size: 0x2000,
            },
        ];
        assert_eq!(sections.load_bias(0x7000_0000, 0), 0x7000_0000);
        assert_eq!(sections.load_bias(0x7001_5000, 0x5000), 0x7000_0000);
        // No matching segment: assume svma == file offset.
        assert_eq!(sections.load_bias(0x7010_0000, 0x9000), 0x700f_7000);
    }

    #[test]
    fn test_empty() {
        let sections = UnwindSections::new(ArchKind::X86_64);
        assert!(sections.is_empty());
        let sections = sections.with_debug_frame(SectionData::new(vec![0u8; 4], 0));
        assert!(!sections.is_empty());
    }
}
