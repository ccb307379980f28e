//! Decoded instruction subset executed by the interpreter.
//!
//! Instructions arrive already decoded (a program image is a table of [`Instr`]
//! values), so this module only describes operands, sizes and a listing format.
//! Branch and relative-jump offsets count instruction words relative to the next
//! instruction; absolute targets count words from the start of flash.

use std::fmt;

use crate::state::{Register, StatusFlag};

/// Indirect addressing pair used by `LD`/`ST`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum PointerRegister {
    /// `r27:r26`.
    X,
    /// `r29:r28`.
    Y,
    /// `r31:r30`.
    Z,
}

impl PointerRegister {
    /// Register holding the low byte of the pair.
    #[must_use]
    pub const fn low(self) -> Register {
        match self {
            Self::X => Register::X,
            Self::Y => Register::Y,
            Self::Z => Register::Z,
        }
    }
}

impl fmt::Display for PointerRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::X => "X",
            Self::Y => "Y",
            Self::Z => "Z",
        })
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[allow(missing_docs)]
pub enum Instr {
    Nop,
    Mov { rd: Register, rr: Register },
    /// Copies the pair starting at `rr` into the pair starting at `rd`.
    Movw { rd: Register, rr: Register },
    Ldi { rd: Register, k: u8 },
    Add { rd: Register, rr: Register },
    Adc { rd: Register, rr: Register },
    Sub { rd: Register, rr: Register },
    Sbc { rd: Register, rr: Register },
    And { rd: Register, rr: Register },
    Or { rd: Register, rr: Register },
    Eor { rd: Register, rr: Register },
    Cp { rd: Register, rr: Register },
    Cpc { rd: Register, rr: Register },
    Subi { rd: Register, k: u8 },
    Andi { rd: Register, k: u8 },
    Ori { rd: Register, k: u8 },
    Cpi { rd: Register, k: u8 },
    Com { rd: Register },
    Inc { rd: Register },
    Dec { rd: Register },
    Lsr { rd: Register },
    /// Adds `k` to the word in the pair starting at `rd`.
    Adiw { rd: Register, k: u8 },
    /// Subtracts `k` from the word in the pair starting at `rd`.
    Sbiw { rd: Register, k: u8 },
    /// Branches when `flag` is set.
    Brbs { flag: StatusFlag, offset: i8 },
    /// Branches when `flag` is clear.
    Brbc { flag: StatusFlag, offset: i8 },
    Rjmp { offset: i16 },
    Jmp { target: u32 },
    /// Jumps to the word address held in `Z`.
    Ijmp,
    Rcall { offset: i16 },
    Call { target: u32 },
    Ret,
    Reti,
    Lds { rd: Register, addr: u16 },
    Sts { addr: u16, rr: Register },
    Ld { rd: Register, ptr: PointerRegister },
    St { ptr: PointerRegister, rr: Register },
    /// Loads the flash byte addressed by `Z`.
    Lpm { rd: Register },
    In { rd: Register, io: u8 },
    Out { io: u8, rr: Register },
    Sbi { io: u8, bit: u8 },
    Cbi { io: u8, bit: u8 },
    /// Skips the next instruction when the I/O bit is clear.
    Sbic { io: u8, bit: u8 },
    /// Skips the next instruction when the I/O bit is set.
    Sbis { io: u8, bit: u8 },
    Push { rr: Register },
    Pop { rd: Register },
    Bset { flag: StatusFlag },
    Bclr { flag: StatusFlag },
    Sleep,
    Break,
    Wdr,
}

impl Instr {
    /// `SEI`.
    pub const SEI: Self = Self::Bset { flag: StatusFlag::I };
    /// `CLI`.
    pub const CLI: Self = Self::Bclr { flag: StatusFlag::I };

    /// `BREQ offset`.
    #[must_use]
    pub const fn breq(offset: i8) -> Self {
        Self::Brbs {
            flag: StatusFlag::Z,
            offset,
        }
    }

    /// `BRNE offset`.
    #[must_use]
    pub const fn brne(offset: i8) -> Self {
        Self::Brbc {
            flag: StatusFlag::Z,
            offset,
        }
    }

    /// Encoded size in bytes.
    #[must_use]
    pub const fn size(self) -> u32 {
        match self {
            Self::Jmp { .. } | Self::Call { .. } | Self::Lds { .. } | Self::Sts { .. } => 4,
            _ => 2,
        }
    }

    /// Lower-case mnemonic.
    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Nop => "nop",
            Self::Mov { .. } => "mov",
            Self::Movw { .. } => "movw",
            Self::Ldi { .. } => "ldi",
            Self::Add { .. } => "add",
            Self::Adc { .. } => "adc",
            Self::Sub { .. } => "sub",
            Self::Sbc { .. } => "sbc",
            Self::And { .. } => "and",
            Self::Or { .. } => "or",
            Self::Eor { .. } => "eor",
            Self::Cp { .. } => "cp",
            Self::Cpc { .. } => "cpc",
            Self::Subi { .. } => "subi",
            Self::Andi { .. } => "andi",
            Self::Ori { .. } => "ori",
            Self::Cpi { .. } => "cpi",
            Self::Com { .. } => "com",
            Self::Inc { .. } => "inc",
            Self::Dec { .. } => "dec",
            Self::Lsr { .. } => "lsr",
            Self::Adiw { .. } => "adiw",
            Self::Sbiw { .. } => "sbiw",
            Self::Brbs { .. } => "brbs",
            Self::Brbc { .. } => "brbc",
            Self::Rjmp { .. } => "rjmp",
            Self::Jmp { .. } => "jmp",
            Self::Ijmp => "ijmp",
            Self::Rcall { .. } => "rcall",
            Self::Call { .. } => "call",
            Self::Ret => "ret",
            Self::Reti => "reti",
            Self::Lds { .. } => "lds",
            Self::Sts { .. } => "sts",
            Self::Ld { .. } => "ld",
            Self::St { .. } => "st",
            Self::Lpm { .. } => "lpm",
            Self::In { .. } => "in",
            Self::Out { .. } => "out",
            Self::Sbi { .. } => "sbi",
            Self::Cbi { .. } => "cbi",
            Self::Sbic { .. } => "sbic",
            Self::Sbis { .. } => "sbis",
            Self::Push { .. } => "push",
            Self::Pop { .. } => "pop",
            Self::Bset { .. } => "bset",
            Self::Bclr { .. } => "bclr",
            Self::Sleep => "sleep",
            Self::Break => "break",
            Self::Wdr => "wdr",
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.mnemonic();
        match *self {
            Self::Nop
            | Self::Ijmp
            | Self::Ret
            | Self::Reti
            | Self::Sleep
            | Self::Break
            | Self::Wdr => f.write_str(name),
            Self::Mov { rd, rr }
            | Self::Movw { rd, rr }
            | Self::Add { rd, rr }
            | Self::Adc { rd, rr }
            | Self::Sub { rd, rr }
            | Self::Sbc { rd, rr }
            | Self::And { rd, rr }
            | Self::Or { rd, rr }
            | Self::Eor { rd, rr }
            | Self::Cp { rd, rr }
            | Self::Cpc { rd, rr } => write!(f, "{name} {rd}, {rr}"),
            Self::Ldi { rd, k }
            | Self::Subi { rd, k }
            | Self::Andi { rd, k }
            | Self::Ori { rd, k }
            | Self::Cpi { rd, k }
            | Self::Adiw { rd, k }
            | Self::Sbiw { rd, k } => write!(f, "{name} {rd}, {k:#04x}"),
            Self::Com { rd }
            | Self::Inc { rd }
            | Self::Dec { rd }
            | Self::Lsr { rd }
            | Self::Pop { rd } => write!(f, "{name} {rd}"),
            Self::Push { rr } => write!(f, "{name} {rr}"),
            Self::Brbs { flag, offset } | Self::Brbc { flag, offset } => {
                write!(f, "{name} {}, .{:+}", flag.bit(), i32::from(offset) * 2)
            }
            Self::Rjmp { offset } | Self::Rcall { offset } => {
                write!(f, "{name} .{:+}", i32::from(offset) * 2)
            }
            Self::Jmp { target } | Self::Call { target } => {
                write!(f, "{name} {:#06x}", u64::from(target) * 2)
            }
            Self::Lds { rd, addr } => write!(f, "{name} {rd}, {addr:#06x}"),
            Self::Sts { addr, rr } => write!(f, "{name} {addr:#06x}, {rr}"),
            Self::Ld { rd, ptr } => write!(f, "{name} {rd}, {ptr}"),
            Self::St { ptr, rr } => write!(f, "{name} {ptr}, {rr}"),
            Self::Lpm { rd } => write!(f, "{name} {rd}, Z"),
            Self::In { rd, io } => write!(f, "{name} {rd}, {io:#04x}"),
            Self::Out { io, rr } => write!(f, "{name} {io:#04x}, {rr}"),
            Self::Sbi { io, bit }
            | Self::Cbi { io, bit }
            | Self::Sbic { io, bit }
            | Self::Sbis { io, bit } => write!(f, "{name} {io:#04x}, {bit}"),
            Self::Bset { flag } | Self::Bclr { flag } => write!(f, "{name} {}", flag.bit()),
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{Instr, PointerRegister};
    use crate::state::{Register, StatusFlag};

    #[rstest]
    #[case(Instr::Nop, 2)]
    #[case(Instr::Jmp { target: 0x40 }, 4)]
    #[case(Instr::Call { target: 0x40 }, 4)]
    #[case(Instr::Lds { rd: Register::R1, addr: 0x100 }, 4)]
    #[case(Instr::Sts { addr: 0x100, rr: Register::R1 }, 4)]
    #[case(Instr::Rcall { offset: -3 }, 2)]
    fn instruction_sizes_follow_encoding_width(#[case] instr: Instr, #[case] size: u32) {
        assert_eq!(instr.size(), size);
    }

    #[rstest]
    #[case(Instr::Add { rd: Register::R1, rr: Register::R2 }, "add r1, r2")]
    #[case(Instr::Ldi { rd: Register::R16, k: 0x2a }, "ldi r16, 0x2a")]
    #[case(Instr::breq(-2), "brbs 1, .-4")]
    #[case(Instr::Jmp { target: 0x20 }, "jmp 0x0040")]
    #[case(Instr::Ld { rd: Register::R0, ptr: PointerRegister::X }, "ld r0, X")]
    #[case(Instr::Out { io: 0x3f, rr: Register::R0 }, "out 0x3f, r0")]
    #[case(Instr::SEI, "bset 7")]
    #[case(Instr::Reti, "reti")]
    fn listing_format_is_stable(#[case] instr: Instr, #[case] text: &str) {
        assert_eq!(instr.to_string(), text);
    }

    #[test]
    fn branch_aliases_test_zero_flag() {
        assert_eq!(
            Instr::brne(1),
            Instr::Brbc {
                flag: StatusFlag::Z,
                offset: 1
            }
        );
        assert_eq!(PointerRegister::Z.low(), Register::R30);
    }
}
