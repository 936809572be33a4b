#![allow(dead_code)]

use std::ops::Range;
use std::sync::Arc;

use quicken_unwind::*;

/// Assembles a little-endian x86_64 `.debug_frame` section. The CIE describes
/// the state at function entry: CFA = rsp + 8, return address at CFA - 8.
/// Code alignment is 1 and data alignment is -8.
pub struct DebugFrameBuilder {
    data: Vec<u8>,
}

impl DebugFrameBuilder {
    pub fn new() -> Self {
        let mut data = Vec::new();
        push_entry(
            &mut data,
            &[
                0xff, 0xff, 0xff, 0xff, // CIE id
                0x01, // version
                0x00, // augmentation ""
                0x01, // code alignment
                0x78, // data alignment -8
                0x10, // return address column
                0x0c, 0x07, 0x08, // def_cfa rsp, 8
                0x90, 0x01, // offset rip, cfa-8
            ],
        );
        Self { data }
    }

    /// Adds a frame descriptor for `range` with the given CFI instructions.
    pub fn fde(mut self, range: Range<u64>, instructions: &[u8]) -> Self {
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes()); // CIE pointer
        body.extend_from_slice(&range.start.to_le_bytes());
        body.extend_from_slice(&(range.end - range.start).to_le_bytes());
        body.extend_from_slice(instructions);
        push_entry(&mut self.data, &body);
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.data
    }
}

fn push_entry(data: &mut Vec<u8>, body: &[u8]) {
    let mut body = body.to_vec();
    // Pad with DW_CFA_nop.
    while (body.len() + 4) % 8 != 0 {
        body.push(0x00);
    }
    data.extend_from_slice(&(body.len() as u32).to_le_bytes());
    data.extend_from_slice(&body);
}

pub fn identity(name: &str) -> BinaryIdentity {
    BinaryIdentity::new(
        format!("/data/app/lib/{name}"),
        BuildId::Embedded(name.bytes().collect()),
        0x4000,
    )
}

pub fn debug_frame_sections(debug_frame: Vec<u8>) -> UnwindSections {
    UnwindSections::new(ArchKind::X86_64).with_debug_frame(SectionData::new(debug_frame, 0))
}

/// An executable mapping of the image `name`. The addresses in its unwind
/// information are runtime addresses.
pub fn mapped_image(name: &str, range: Range<u64>, sections: Option<UnwindSections>) -> MappedRegion {
    let image = Image::new(identity(name), sections);
    let path = image.identity().path().to_owned();
    MappedRegion::new(
        range,
        0,
        Permissions::READ | Permissions::EXECUTE | Permissions::PRIVATE,
        Some(path),
    )
    .with_image(image)
    .with_load_bias(0)
}

pub fn data_region(range: Range<u64>) -> MappedRegion {
    MappedRegion::new(range, 0, Permissions::READ | Permissions::WRITE, None)
}

/// A captured stack starting at `base`, one 64-bit word per entry.
pub fn stack(base: u64, words: &[u64]) -> MemorySource {
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    MemorySource::captured(base, bytes)
}

pub fn unwinder(
    regions: Vec<MappedRegion>,
    memory: MemorySource,
    config: UnwinderConfig,
) -> UnwinderX86_64 {
    Unwinder::with_address_space(config, Arc::new(AddressSpace::from_regions(regions)), memory)
}

/// A relocatable x86_64 ELF object with some code and the given
/// `.debug_frame` contents.
pub fn elf_with_debug_frame(debug_frame: &[u8]) -> Vec<u8> {
    elf_with_section(".debug_frame", debug_frame)
}

/// A relocatable x86_64 ELF object with some code and one extra section.
pub fn elf_with_section(name: &str, data: &[u8]) -> Vec<u8> {
    use object::write::{Object, StandardSection};
    use object::{Architecture, BinaryFormat, Endianness, SectionKind};

    let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
    let text = obj.section_id(StandardSection::Text);
    obj.append_section_data(text, &[0xc3; 0x100], 16);
    let section = obj.add_section(Vec::new(), name.as_bytes().to_vec(), SectionKind::Debug);
    obj.append_section_data(section, data, 8);
    obj.write().unwrap()
}
