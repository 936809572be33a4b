use std::collections::HashMap;
use std::fmt::Debug;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::arch::ArchKind;
use crate::display_utils::HexNum;
use crate::identity::BinaryIdentity;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Entry {
    pc_start: u64,
    pc_end: u64,
    code_offset: u32,
    code_len: u32,
}

/// One entry of a program: an address range and its instruction bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EntryRef<'a> {
    pub pc_start: u64,
    pub pc_end: u64,
    pub code: &'a [u8],
}

impl Debug for EntryRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}..{:?} {}",
            HexNum(self.pc_start),
            HexNum(self.pc_end),
            crate::display_utils::HexBytes(self.code)
        )
    }
}

/// The compiled unwind program of one binary image.
///
/// Entries cover disjoint half-open address ranges relative to the image's
/// load bias and are sorted by start address. A program is immutable once
/// built; the only mutable state is the stale flag, which is set when the
/// image is unloaded while the program may still be in use.
pub struct UnwindProgram {
    identity: BinaryIdentity,
    arch: ArchKind,
    entries: Vec<Entry>,
    code: Vec<u8>,
    stale: AtomicBool,
}

impl UnwindProgram {
    /// A program without entries, for images without unwind information.
    pub fn empty(identity: BinaryIdentity, arch: ArchKind) -> Self {
        ProgramBuilder::new().finish(identity, arch)
    }

    pub fn identity(&self) -> &BinaryIdentity {
        &self.identity
    }

    pub fn arch(&self) -> ArchKind {
        self.arch
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Finds the entry whose range contains `pc`.
    pub fn lookup(&self, pc: u64) -> Option<EntryRef<'_>> {
        let index = self.entries.partition_point(|e| e.pc_start <= pc);
        let entry = self.entries.get(index.checked_sub(1)?)?;
        if pc < entry.pc_end {
            Some(self.entry_ref(entry))
        } else {
            None
        }
    }

    pub fn entries(&self) -> impl ExactSizeIterator<Item = EntryRef<'_>> + '_ {
        self.entries.iter().map(|entry| self.entry_ref(entry))
    }

    /// The total size of the deduplicated instruction bytes.
    pub fn code_size(&self) -> usize {
        self.code.len()
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    fn entry_ref(&self, entry: &Entry) -> EntryRef<'_> {
        let start = entry.code_offset as usize;
        let end = start + entry.code_len as usize;
        EntryRef {
            pc_start: entry.pc_start,
            pc_end: entry.pc_end,
            code: self.code.get(start..end).unwrap_or_default(),
        }
    }
}

impl Debug for UnwindProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnwindProgram")
            .field("identity", &self.identity)
            .field("arch", &self.arch)
            .field("entries", &self.entries.len())
            .field("code_size", &self.code.len())
            .field("stale", &self.is_stale())
            .finish()
    }
}

/// Collects entries into an [`UnwindProgram`]. Identical instruction
/// sequences share their bytes, and adjacent ranges with identical
/// instructions are merged.
#[derive(Default)]
pub struct ProgramBuilder {
    entries: Vec<Entry>,
    code: Vec<u8>,
    interned: HashMap<Vec<u8>, u32>,
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, range: Range<u64>, code: &[u8]) {
        if range.start >= range.end {
            return;
        }
        let code_offset = match self.interned.get(code) {
            Some(offset) => *offset,
            None => {
                let offset = self.code.len() as u32;
                self.code.extend_from_slice(code);
                self.interned.insert(code.to_vec(), offset);
                offset
            }
        };
        let code_len = code.len() as u32;
        if let Some(last) = self.entries.last_mut() {
            if last.pc_end == range.start
                && last.code_offset == code_offset
                && last.code_len == code_len
            {
                last.pc_end = range.end;
                return;
            }
        }
        self.entries.push(Entry {
            pc_start: range.start,
            pc_end: range.end,
            code_offset,
            code_len,
        });
    }

    /// Adds the entries of `lower` only where this builder has no coverage
    /// yet. Used to layer unwind sources of decreasing priority.
    pub fn fill_gaps(&mut self, lower: ProgramBuilder) {
        let mut covered: Vec<Range<u64>> = self.entries.iter().map(|e| e.pc_start..e.pc_end).collect();
        covered.sort_by_key(|r| r.start);
        let mut coverage: Vec<Range<u64>> = Vec::with_capacity(covered.len());
        for range in covered {
            match coverage.last_mut() {
                Some(last) if range.start <= last.end => last.end = last.end.max(range.end),
                _ => coverage.push(range),
            }
        }

        let mut lower_entries = lower.entries;
        lower_entries.sort_by_key(|e| (e.pc_start, e.pc_end));
        for entry in lower_entries {
            let start = entry.code_offset as usize;
            let code = lower
                .code
                .get(start..start + entry.code_len as usize)
                .unwrap_or_default();
            let mut pc = entry.pc_start;
            let mut index = coverage.partition_point(|r| r.end <= pc);
            while pc < entry.pc_end {
                match coverage.get(index) {
                    Some(range) if range.start < entry.pc_end => {
                        if pc < range.start {
                            self.push(pc..range.start, code);
                        }
                        pc = pc.max(range.end);
                        index += 1;
                    }
                    _ => {
                        self.push(pc..entry.pc_end, code);
                        break;
                    }
                }
            }
        }
    }

    /// Sorts the entries and resolves overlaps: an entry that overlaps its
    /// predecessor is trimmed to start where the predecessor ends.
    pub fn finish(mut self, identity: BinaryIdentity, arch: ArchKind) -> UnwindProgram {
        self.entries.sort_by_key(|e| (e.pc_start, e.pc_end));
        let mut entries: Vec<Entry> = Vec::with_capacity(self.entries.len());
        for mut entry in self.entries {
            if let Some(last) = entries.last_mut() {
                if entry.pc_start < last.pc_end {
                    entry.pc_start = last.pc_end;
                    if entry.pc_start >= entry.pc_end {
                        continue;
                    }
                }
                if last.pc_end == entry.pc_start
                    && last.code_offset == entry.code_offset
                    && last.code_len == entry.code_len
                {
                    last.pc_end = entry.pc_end;
                    continue;
                }
            }
            entries.push(entry);
        }
        entries.shrink_to_fit();
        self.code.shrink_to_fit();
        UnwindProgram {
            identity,
            arch,
            entries,
            code: self.code,
            stale: AtomicBool::new(false),
        }
    }
}
