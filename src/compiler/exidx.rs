//! ARM EHABI (`.ARM.exidx` / `.ARM.extab`) decoding.
//!
//! EHABI describes unwinding as a sequence of operations on a virtual stack
//! pointer (vsp). We replay those operations once to find where each popped
//! register lives relative to the final vsp, which is the caller's SP and so
//! the CFA.

use arrayvec::ArrayVec;

use crate::arch::ArchKind;
use crate::arm::reg;
use crate::qut::{Instruction, ProgramBuilder};
use crate::sections::{SectionData, UnwindSections};
use crate::stats::CompileStatistics;

const EXIDX_CANTUNWIND: u32 = 1;

/// 3 inline bytes plus up to 255 extra words.
pub(crate) const MAX_EHABI_BYTES: usize = 1024;

/// Upper bound for the encoded instructions of one EHABI entry.
pub(crate) const MAX_ENCODED_LEN: usize = 256;

/// The unwind description of one function.
pub(crate) enum ExidxEntry {
    CantUnwind,
    Bytes(ArrayVec<u8, MAX_EHABI_BYTES>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EhabiError {
    /// No entry covers the address.
    NoCoverage,
    /// The table could not be read.
    Malformed,
    /// The opcodes use a feature we do not model.
    Unsupported,
}

fn read_word(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Resolves a 31-bit place-relative offset stored at `place`.
fn prel31(place: u64, word: u32) -> u64 {
    let offset = ((word << 1) as i32 >> 1) as i64;
    place.wrapping_add(offset as u64)
}

fn read_word_at_svma(section: &SectionData, svma: u64) -> Option<u32> {
    let offset = svma.checked_sub(section.svma())?;
    read_word(section.data(), usize::try_from(offset).ok()?)
}

/// The number of entries in the index table.
fn entry_count(exidx: &SectionData) -> usize {
    exidx.data().len() / 8
}

/// The function start address of entry `index`.
fn function_start(exidx: &SectionData, index: usize) -> Option<u64> {
    let word = read_word(exidx.data(), index * 8)?;
    Some(prel31(exidx.svma() + index as u64 * 8, word))
}

/// The end of the function described by the last table entry: the end of
/// the image's code, or one Thumb instruction if that is unknown.
fn last_function_end(sections: &UnwindSections, start: u64) -> u64 {
    sections
        .code_end_svma()
        .filter(|&end| end > start)
        .unwrap_or(start + 2)
}

/// Reads the unwind bytes of entry `index`.
fn read_entry(sections: &UnwindSections, exidx: &SectionData, index: usize) -> Result<ExidxEntry, EhabiError> {
    let entry_svma = exidx.svma() + index as u64 * 8;
    let data = read_word(exidx.data(), index * 8 + 4).ok_or(EhabiError::Malformed)?;
    if data == EXIDX_CANTUNWIND {
        return Ok(ExidxEntry::CantUnwind);
    }
    let mut bytes = ArrayVec::new();
    if data & 0x8000_0000 != 0 {
        // Compact model, inline in the index table.
        if (data >> 24) & 0x0f != 0 {
            return Err(EhabiError::Unsupported);
        }
        bytes.extend([(data >> 16) as u8, (data >> 8) as u8, data as u8]);
        return Ok(ExidxEntry::Bytes(bytes));
    }

    let extab = sections.arm_extab.as_ref().ok_or(EhabiError::Malformed)?;
    let mut address = prel31(entry_svma + 4, data);
    let first = read_word_at_svma(extab, address).ok_or(EhabiError::Malformed)?;
    let (head, extra_words) = if first & 0x8000_0000 != 0 {
        match (first >> 24) & 0x0f {
            0 => {
                bytes.extend([(first >> 16) as u8, (first >> 8) as u8, first as u8]);
                (None, 0)
            }
            1 | 2 => {
                bytes.extend([(first >> 8) as u8, first as u8]);
                (None, (first >> 16) & 0xff)
            }
            _ => return Err(EhabiError::Unsupported),
        }
    } else {
        // Generic model: a personality routine followed by data in the same
        // layout the compact model uses for personality 1 and 2.
        address += 4;
        let word = read_word_at_svma(extab, address).ok_or(EhabiError::Malformed)?;
        (Some(word), word >> 24)
    };
    if let Some(word) = head {
        bytes.extend([(word >> 16) as u8, (word >> 8) as u8, word as u8]);
    }
    for _ in 0..extra_words {
        address += 4;
        let word = read_word_at_svma(extab, address).ok_or(EhabiError::Malformed)?;
        bytes
            .try_extend_from_slice(&word.to_be_bytes())
            .map_err(|_| EhabiError::Malformed)?;
    }
    Ok(ExidxEntry::Bytes(bytes))
}

/// The result of replaying the opcodes of one function.
struct VirtualStack {
    base: u16,
    offset: i64,
    saved: ArrayVec<(u16, i64), 16>,
    refused: bool,
}

impl VirtualStack {
    fn new() -> Self {
        Self {
            base: reg::SP,
            offset: 0,
            saved: ArrayVec::new(),
            refused: false,
        }
    }

    fn pop(&mut self, register: u16) -> Result<(), EhabiError> {
        if register == reg::SP {
            // Loading vsp from the stack cannot be expressed relative to the CFA.
            return Err(EhabiError::Unsupported);
        }
        if let Some(slot) = self.saved.iter_mut().find(|(r, _)| *r == register) {
            slot.1 = self.offset;
        } else {
            self.saved
                .try_push((register, self.offset))
                .map_err(|_| EhabiError::Unsupported)?;
        }
        self.offset += 4;
        Ok(())
    }

    fn pop_mask(&mut self, mask: u16, first_register: u16) -> Result<(), EhabiError> {
        for bit in 0..16 {
            if mask & (1 << bit) != 0 {
                self.pop(first_register + bit)?;
            }
        }
        Ok(())
    }

    fn execute(&mut self, bytes: &[u8], stats: &mut CompileStatistics) -> Result<(), EhabiError> {
        fn next(iter: &mut impl Iterator<Item = u8>) -> Result<u8, EhabiError> {
            iter.next().ok_or(EhabiError::Malformed)
        }
        let mut iter = bytes.iter().copied();
        while let Some(op) = iter.next() {
            match op {
                0x00..=0x3f => self.offset += (i64::from(op & 0x3f) << 2) + 4,
                0x40..=0x7f => self.offset -= (i64::from(op & 0x3f) << 2) + 4,
                0x80..=0x8f => {
                    let low = next(&mut iter)?;
                    let mask = u16::from(op & 0x0f) << 8 | u16::from(low);
                    if mask == 0 {
                        self.refused = true;
                        return Ok(());
                    }
                    self.pop_mask(mask, 4)?;
                }
                0x90..=0x9f => {
                    let register = u16::from(op & 0x0f);
                    if register == reg::SP || register == reg::PC {
                        stats.unsupported_ehabi_opcodes += 1;
                        return Err(EhabiError::Unsupported);
                    }
                    if !self.saved.is_empty() {
                        // Earlier pops were relative to another base register.
                        return Err(EhabiError::Unsupported);
                    }
                    self.base = register;
                    self.offset = 0;
                }
                0xa0..=0xaf => {
                    let count = u16::from(op & 0x07);
                    for register in 4..=4 + count {
                        self.pop(register)?;
                    }
                    if op & 0x08 != 0 {
                        self.pop(reg::LR)?;
                    }
                }
                0xb0 => return Ok(()),
                0xb1 => {
                    let mask = next(&mut iter)?;
                    if mask == 0 || mask & 0xf0 != 0 {
                        stats.unsupported_ehabi_opcodes += 1;
                        return Err(EhabiError::Unsupported);
                    }
                    self.pop_mask(u16::from(mask), 0)?;
                }
                0xb2 => {
                    let mut value: u64 = 0;
                    let mut shift = 0;
                    loop {
                        let byte = next(&mut iter)?;
                        if shift >= 63 {
                            return Err(EhabiError::Malformed);
                        }
                        value |= u64::from(byte & 0x7f) << shift;
                        shift += 7;
                        if byte & 0x80 == 0 {
                            break;
                        }
                    }
                    let value = i64::try_from(value).map_err(|_| EhabiError::Malformed)?;
                    self.offset += 0x204 + (value << 2);
                }
                0xb3 => {
                    let operand = next(&mut iter)?;
                    self.offset += (i64::from(operand & 0x0f) + 1) * 8 + 4;
                }
                0xb8..=0xbf => self.offset += (i64::from(op & 0x07) + 1) * 8 + 4,
                0xc0..=0xc5 => self.offset += (i64::from(op & 0x07) + 1) * 8,
                0xc6 | 0xc8 | 0xc9 => {
                    let operand = next(&mut iter)?;
                    self.offset += (i64::from(operand & 0x0f) + 1) * 8;
                }
                0xc7 => {
                    let mask = next(&mut iter)?;
                    if mask == 0 || mask & 0xf0 != 0 {
                        stats.unsupported_ehabi_opcodes += 1;
                        return Err(EhabiError::Unsupported);
                    }
                    self.offset += 4 * i64::from(mask.count_ones());
                }
                0xd0..=0xd7 => self.offset += (i64::from(op & 0x07) + 1) * 8,
                _ => {
                    stats.unsupported_ehabi_opcodes += 1;
                    return Err(EhabiError::Unsupported);
                }
            }
        }
        Ok(())
    }

    /// Encodes the replayed state as Quicken instructions.
    fn encode<W: std::io::Write>(&self, out: &mut W) -> std::io::Result<()> {
        let arch = ArchKind::Arm;
        if self.refused {
            Instruction::Undefined(reg::LR).encode(arch, out)?;
            return Instruction::End.encode(arch, out);
        }
        Instruction::CfaRegisterOffset {
            register: self.base,
            offset: self.offset,
        }
        .encode(arch, out)?;
        let popped_pc = self.saved.iter().find(|(r, _)| *r == reg::PC);
        for &(register, offset) in &self.saved {
            if register == reg::LR && popped_pc.is_some() {
                continue;
            }
            let register = if register == reg::PC { reg::LR } else { register };
            Instruction::SavedAt {
                register,
                offset: offset - self.offset,
            }
            .encode(arch, out)?;
        }
        Instruction::End.encode(arch, out)
    }
}

/// Translates one EHABI entry into encoded Quicken instructions.
pub(crate) fn translate_entry<W: std::io::Write>(
    entry: &ExidxEntry,
    stats: &mut CompileStatistics,
    out: &mut W,
) -> Result<(), EhabiError> {
    let mut stack = VirtualStack::new();
    match entry {
        ExidxEntry::CantUnwind => stack.refused = true,
        ExidxEntry::Bytes(bytes) => stack.execute(bytes, stats)?,
    }
    stack.encode(out).map_err(|_| EhabiError::Malformed)
}

/// Compiles the whole index table into `builder`.
pub(crate) fn compile_exidx(
    sections: &UnwindSections,
    builder: &mut ProgramBuilder,
    stats: &mut CompileStatistics,
) {
    let Some(exidx) = sections.arm_exidx.as_ref() else {
        return;
    };
    let count = entry_count(exidx);
    let mut starts: Vec<(u64, usize)> = (0..count)
        .filter_map(|index| Some((function_start(exidx, index)?, index)))
        .collect();
    starts.sort_unstable();

    let mut code = Vec::with_capacity(16);
    for (position, &(start, index)) in starts.iter().enumerate() {
        let end = match starts.get(position + 1) {
            Some(&(next_start, _)) => next_start,
            None => last_function_end(sections, start),
        };
        code.clear();
        let translated = read_entry(sections, exidx, index)
            .and_then(|entry| translate_entry(&entry, stats, &mut code));
        if let Err(e) = translated {
            tracing::trace!("EHABI entry for 0x{start:x} not translated: {e:?}");
            code.clear();
            let _ = Instruction::Unsupported.encode(ArchKind::Arm, &mut code);
        }
        stats.record_code(&code, ArchKind::Arm);
        builder.push(start..end, &code);
    }
}

/// Looks up and translates the EHABI entry covering `svma`, without
/// allocating.
pub(crate) fn instructions_for_address(
    sections: &UnwindSections,
    svma: u64,
    out: &mut ArrayVec<u8, MAX_ENCODED_LEN>,
) -> Result<(), EhabiError> {
    let exidx = sections.arm_exidx.as_ref().ok_or(EhabiError::Malformed)?;
    let count = entry_count(exidx);
    // The table is sorted by function start.
    let mut low = 0;
    let mut high = count;
    while low < high {
        let mid = low + (high - low) / 2;
        let start = function_start(exidx, mid).ok_or(EhabiError::Malformed)?;
        if start <= svma {
            low = mid + 1;
        } else {
            high = mid;
        }
    }
    let index = low.checked_sub(1).ok_or(EhabiError::NoCoverage)?;
    if index + 1 == count {
        let start = function_start(exidx, index).ok_or(EhabiError::Malformed)?;
        if svma >= last_function_end(sections, start) {
            return Err(EhabiError::NoCoverage);
        }
    }
    let entry = read_entry(sections, exidx, index)?;
    let mut stats = CompileStatistics::default();
    translate_entry(&entry, &mut stats, out)
}
