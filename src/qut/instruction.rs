//! The Quicken instruction set.
//!
//! Every entry of an [`UnwindProgram`](super::UnwindProgram) is a short byte
//! string of instructions. The encoding favours the common case of a function
//! with an SP-relative CFA and only a return address (plus maybe a few callee-saved
//! registers) on the stack, which usually encodes to two or three bytes.
//!
//! `W` is the pointer size of the architecture, `n` a 6-bit unsigned operand,
//! `r` a 5-bit register number.
//!
//! ```text
//! 00nn nnnn                     CFA = SP + n * W
//! 01nn nnnn                     RA is saved at CFA - n * W
//! 100r rrrr  SLEB(off)          r is saved at CFA + off
//! 101r rrrr                     r is unchanged
//! 1100 0000  ULEB(r) SLEB(off)  CFA = r + off
//! 1100 0001  ULEB(r) SLEB(off)  r is saved at CFA + off
//! 1100 0010  ULEB(r)            r is unchanged
//! 1100 0011  ULEB(r)            r is undefined (outermost frame if r is RA)
//! 1100 0100  ULEB(r) SLEB(v)    r = v
//! 1100 0101  ULEB(r) SLEB(off)  r = CFA + off
//! 1100 0110  ULEB(r) ULEB(s)    r = value of s in the callee
//! 1100 0111  ULEB(len) bytes    CFA = DWARF expression
//! 1111 1110                     unsupported, use the full DWARF evaluator
//! 1111 1111                     end of program
//! ```

use fallible_iterator::FallibleIterator;
use gimli::{EndianSlice, LittleEndian, Reader};

use crate::arch::ArchKind;

const SHORT_CFA_SP: u8 = 0x00;
const SHORT_RA_AT_CFA: u8 = 0x40;
const SHORT_SAVED_AT: u8 = 0x80;
const SHORT_SAME_VALUE: u8 = 0xa0;
const CFA_REGISTER_OFFSET: u8 = 0xc0;
const SAVED_AT: u8 = 0xc1;
const SAME_VALUE: u8 = 0xc2;
const UNDEFINED: u8 = 0xc3;
const CONSTANT: u8 = 0xc4;
const VAL_CFA_OFFSET: u8 = 0xc5;
const IN_REGISTER: u8 = 0xc6;
const CFA_EXPRESSION: u8 = 0xc7;
const UNSUPPORTED: u8 = 0xfe;
const END: u8 = 0xff;

/// The number of distinct instruction kinds, for statistics.
pub const INSTRUCTION_KIND_COUNT: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Instruction<'a> {
    CfaRegisterOffset { register: u16, offset: i64 },
    CfaExpression(&'a [u8]),
    SameValue(u16),
    Undefined(u16),
    SavedAt { register: u16, offset: i64 },
    ValCfaOffset { register: u16, offset: i64 },
    Constant { register: u16, value: i64 },
    InRegister { register: u16, source: u16 },
    Unsupported,
    End,
}

impl Instruction<'_> {
    /// A small index identifying the kind of this instruction.
    pub fn kind_index(&self) -> usize {
        match self {
            Instruction::CfaRegisterOffset { .. } => 0,
            Instruction::CfaExpression(_) => 1,
            Instruction::SameValue(_) => 2,
            Instruction::Undefined(_) => 3,
            Instruction::SavedAt { .. } => 4,
            Instruction::ValCfaOffset { .. } => 5,
            Instruction::Constant { .. } => 6,
            Instruction::InRegister { .. } => 7,
            Instruction::Unsupported => 8,
            Instruction::End => 9,
        }
    }

    /// Appends the encoding of this instruction to `w`.
    pub fn encode<W: std::io::Write>(&self, arch: ArchKind, w: &mut W) -> std::io::Result<()> {
        let word = i64::from(arch.pointer_size());
        match *self {
            Instruction::CfaRegisterOffset { register, offset } => {
                if register == arch.sp_register() {
                    if let Some(n) = short_operand(offset, word) {
                        return w.write_all(&[SHORT_CFA_SP | n]);
                    }
                }
                w.write_all(&[CFA_REGISTER_OFFSET])?;
                write_uleb(w, register.into())?;
                write_sleb(w, offset)
            }
            Instruction::CfaExpression(expression) => {
                w.write_all(&[CFA_EXPRESSION])?;
                write_uleb(w, expression.len() as u64)?;
                w.write_all(expression)
            }
            Instruction::SavedAt { register, offset } => {
                if register == arch.return_address_register() {
                    if let Some(n) = offset.checked_neg().and_then(|o| short_operand(o, word)) {
                        return w.write_all(&[SHORT_RA_AT_CFA | n]);
                    }
                }
                if register < 32 {
                    w.write_all(&[SHORT_SAVED_AT | register as u8])?;
                } else {
                    w.write_all(&[SAVED_AT])?;
                    write_uleb(w, register.into())?;
                }
                write_sleb(w, offset)
            }
            Instruction::SameValue(register) => {
                if register < 32 {
                    w.write_all(&[SHORT_SAME_VALUE | register as u8])
                } else {
                    w.write_all(&[SAME_VALUE])?;
                    write_uleb(w, register.into())
                }
            }
            Instruction::Undefined(register) => {
                w.write_all(&[UNDEFINED])?;
                write_uleb(w, register.into())
            }
            Instruction::Constant { register, value } => {
                w.write_all(&[CONSTANT])?;
                write_uleb(w, register.into())?;
                write_sleb(w, value)
            }
            Instruction::ValCfaOffset { register, offset } => {
                w.write_all(&[VAL_CFA_OFFSET])?;
                write_uleb(w, register.into())?;
                write_sleb(w, offset)
            }
            Instruction::InRegister { register, source } => {
                w.write_all(&[IN_REGISTER])?;
                write_uleb(w, register.into())?;
                write_uleb(w, source.into())
            }
            Instruction::Unsupported => w.write_all(&[UNSUPPORTED]),
            Instruction::End => w.write_all(&[END]),
        }
    }
}

/// Returns `n` if `offset == n * word` for some `n` in `0..64`.
fn short_operand(offset: i64, word: i64) -> Option<u8> {
    if offset < 0 || offset % word != 0 {
        return None;
    }
    let n = offset / word;
    (n < 64).then_some(n as u8)
}

fn write_uleb<W: std::io::Write>(w: &mut W, value: u64) -> std::io::Result<()> {
    gimli::leb128::write::unsigned(w, value).map(|_| ())
}

fn write_sleb<W: std::io::Write>(w: &mut W, value: i64) -> std::io::Result<()> {
    gimli::leb128::write::signed(w, value).map(|_| ())
}

/// Decodes an instruction stream. Decoding stops at the end marker or at the
/// end of the bytes, whichever comes first. Does not allocate.
pub struct Instructions<'a> {
    reader: EndianSlice<'a, LittleEndian>,
    arch: ArchKind,
    done: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(code: &'a [u8], arch: ArchKind) -> Self {
        Self {
            reader: EndianSlice::new(code, LittleEndian),
            arch,
            done: false,
        }
    }

    fn read_register(&mut self) -> gimli::Result<u16> {
        let register = self.reader.read_uleb128()?;
        u16::try_from(register).map_err(|_| gimli::Error::BadUnsignedLeb128)
    }
}

impl<'a> FallibleIterator for Instructions<'a> {
    type Item = Instruction<'a>;
    type Error = gimli::Error;

    fn next(&mut self) -> gimli::Result<Option<Instruction<'a>>> {
        if self.done || self.reader.is_empty() {
            return Ok(None);
        }
        let word = i64::from(self.arch.pointer_size());
        let opcode = self.reader.read_u8()?;
        let instruction = match opcode {
            0x00..=0x3f => Instruction::CfaRegisterOffset {
                register: self.arch.sp_register(),
                offset: i64::from(opcode & 0x3f) * word,
            },
            0x40..=0x7f => Instruction::SavedAt {
                register: self.arch.return_address_register(),
                offset: -(i64::from(opcode & 0x3f) * word),
            },
            0x80..=0x9f => Instruction::SavedAt {
                register: u16::from(opcode & 0x1f),
                offset: self.reader.read_sleb128()?,
            },
            0xa0..=0xbf => Instruction::SameValue(u16::from(opcode & 0x1f)),
            CFA_REGISTER_OFFSET => Instruction::CfaRegisterOffset {
                register: self.read_register()?,
                offset: self.reader.read_sleb128()?,
            },
            SAVED_AT => Instruction::SavedAt {
                register: self.read_register()?,
                offset: self.reader.read_sleb128()?,
            },
            SAME_VALUE => Instruction::SameValue(self.read_register()?),
            UNDEFINED => Instruction::Undefined(self.read_register()?),
            CONSTANT => Instruction::Constant {
                register: self.read_register()?,
                value: self.reader.read_sleb128()?,
            },
            VAL_CFA_OFFSET => Instruction::ValCfaOffset {
                register: self.read_register()?,
                offset: self.reader.read_sleb128()?,
            },
            IN_REGISTER => Instruction::InRegister {
                register: self.read_register()?,
                source: self.read_register()?,
            },
            CFA_EXPRESSION => {
                let len = self.reader.read_uleb128()?;
                let len = usize::try_from(len).map_err(|_| gimli::Error::BadUnsignedLeb128)?;
                let expression = self.reader.split(len)?;
                Instruction::CfaExpression(expression.slice())
            }
            UNSUPPORTED => Instruction::Unsupported,
            END => {
                self.done = true;
                Instruction::End
            }
            _ => return Err(gimli::Error::UnknownCallFrameInstruction(gimli::constants::DwCfa(opcode))),
        };
        Ok(Some(instruction))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn encode(arch: ArchKind, instructions: &[Instruction]) -> Vec<u8> {
        let mut code = Vec::new();
        for instruction in instructions {
            instruction.encode(arch, &mut code).unwrap();
        }
        code
    }

    fn decode(arch: ArchKind, code: &[u8]) -> Vec<Instruction<'_>> {
        Instructions::new(code, arch).collect().unwrap()
    }

    #[test]
    fn test_leaf_function_is_compact() {
        // x86_64 function after `sub rsp, 0x18`.
        let instructions = [
            Instruction::CfaRegisterOffset {
                register: 7,
                offset: 0x20,
            },
            Instruction::SavedAt {
                register: 16,
                offset: -8,
            },
            Instruction::End,
        ];
        let code = encode(ArchKind::X86_64, &instructions);
        assert_eq!(code, [0x04, 0x41, 0xff]);
        assert_eq!(decode(ArchKind::X86_64, &code), instructions);
    }

    #[test]
    fn test_long_forms() {
        let expression = [0x77, 0x08];
        let instructions = [
            Instruction::CfaRegisterOffset {
                register: 6,
                offset: 16,
            },
            Instruction::SavedAt {
                register: 6,
                offset: -16,
            },
            Instruction::SavedAt {
                register: 40,
                offset: 8,
            },
            Instruction::SameValue(3),
            Instruction::SameValue(33),
            Instruction::Undefined(16),
            Instruction::Constant {
                register: 1,
                value: -5,
            },
            Instruction::ValCfaOffset {
                register: 2,
                offset: -24,
            },
            Instruction::InRegister {
                register: 30,
                source: 19,
            },
            Instruction::CfaExpression(&expression),
            Instruction::Unsupported,
            Instruction::End,
        ];
        let code = encode(ArchKind::X86_64, &instructions);
        assert_eq!(decode(ArchKind::X86_64, &code), instructions);
    }

    #[test]
    fn test_short_forms_scale_with_pointer_size() {
        let code = [0x02, 0x41];
        assert_eq!(
            decode(ArchKind::Arm, &code),
            [
                Instruction::CfaRegisterOffset {
                    register: 13,
                    offset: 8
                },
                Instruction::SavedAt {
                    register: 14,
                    offset: -4
                },
            ]
        );
        // An offset that is not a multiple of the word size needs the long form.
        let code = encode(
            ArchKind::Aarch64,
            &[Instruction::CfaRegisterOffset {
                register: 31,
                offset: 12,
            }],
        );
        assert_eq!(code, [0xc0, 31, 12]);
    }

    #[test]
    fn test_decoding_stops_at_end() {
        let code = [0x01, 0xff, 0x02];
        assert_eq!(decode(ArchKind::X86_64, &code).len(), 2);
    }

    #[test]
    fn test_truncated_stream_is_an_error() {
        let mut instructions = Instructions::new(&[0xc0, 0x07], ArchKind::X86_64);
        assert!(instructions.next().is_err());
        let mut instructions = Instructions::new(&[0xd0], ArchKind::X86_64);
        assert!(instructions.next().is_err());
    }
}
