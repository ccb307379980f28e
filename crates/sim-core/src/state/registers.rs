use std::fmt;

/// Number of general-purpose registers mapped at the bottom of the data space.
pub const NUM_REGS: usize = 32;

/// General-purpose register identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Register {
    R0 = 0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    R16,
    R17,
    R18,
    R19,
    R20,
    R21,
    R22,
    R23,
    R24,
    R25,
    R26,
    R27,
    R28,
    R29,
    R30,
    R31,
}

impl Register {
    /// Ordered list of all general-purpose registers.
    pub const ALL: [Self; NUM_REGS] = [
        Self::R0,
        Self::R1,
        Self::R2,
        Self::R3,
        Self::R4,
        Self::R5,
        Self::R6,
        Self::R7,
        Self::R8,
        Self::R9,
        Self::R10,
        Self::R11,
        Self::R12,
        Self::R13,
        Self::R14,
        Self::R15,
        Self::R16,
        Self::R17,
        Self::R18,
        Self::R19,
        Self::R20,
        Self::R21,
        Self::R22,
        Self::R23,
        Self::R24,
        Self::R25,
        Self::R26,
        Self::R27,
        Self::R28,
        Self::R29,
        Self::R30,
        Self::R31,
    ];

    /// Low byte of the `X` pointer pair.
    pub const X: Self = Self::R26;
    /// Low byte of the `Y` pointer pair.
    pub const Y: Self = Self::R28;
    /// Low byte of the `Z` pointer pair.
    pub const Z: Self = Self::R30;

    /// Returns the register number, which is also its data-space address.
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Decodes a 5-bit register number.
    #[must_use]
    pub const fn from_u5(bits: u8) -> Option<Self> {
        if (bits as usize) < NUM_REGS {
            Some(Self::ALL[bits as usize])
        } else {
            None
        }
    }

    /// Register that holds the high byte when this register starts a pair.
    #[must_use]
    pub const fn next(self) -> Self {
        Self::ALL[(self as usize + 1) % NUM_REGS]
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.index())
    }
}

/// Status-register flag, numbered by its bit position in `SREG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[repr(u8)]
pub enum StatusFlag {
    /// Carry.
    C = 0,
    /// Zero.
    Z = 1,
    /// Negative.
    N = 2,
    /// Two's complement overflow.
    V = 3,
    /// Sign, `N ^ V`.
    S = 4,
    /// Half carry.
    H = 5,
    /// Bit copy storage.
    T = 6,
    /// Global interrupt enable.
    I = 7,
}

impl StatusFlag {
    /// Flags in bit order.
    pub const ALL: [Self; 8] = [
        Self::C,
        Self::Z,
        Self::N,
        Self::V,
        Self::S,
        Self::H,
        Self::T,
        Self::I,
    ];

    /// Bit position inside `SREG`.
    #[must_use]
    pub const fn bit(self) -> u8 {
        self as u8
    }

    /// Flag stored at an `SREG` bit position.
    #[must_use]
    pub const fn from_bit(bit: u8) -> Option<Self> {
        if bit < 8 {
            Some(Self::ALL[bit as usize])
        } else {
            None
        }
    }

    /// Lower-case mnemonic letter used by `brbs`/`bset` style listings.
    #[must_use]
    pub const fn letter(self) -> char {
        match self {
            Self::C => 'c',
            Self::Z => 'z',
            Self::N => 'n',
            Self::V => 'v',
            Self::S => 's',
            Self::H => 'h',
            Self::T => 't',
            Self::I => 'i',
        }
    }
}

/// Eight discrete status flags, composed into a byte only when read as `SREG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[allow(clippy::struct_excessive_bools)]
pub struct StatusRegister {
    /// Global interrupt enable.
    pub i: bool,
    /// Bit copy storage.
    pub t: bool,
    /// Half carry.
    pub h: bool,
    /// Sign.
    pub s: bool,
    /// Overflow.
    pub v: bool,
    /// Negative.
    pub n: bool,
    /// Zero.
    pub z: bool,
    /// Carry.
    pub c: bool,
}

impl StatusRegister {
    /// Reads one flag.
    #[must_use]
    pub const fn get(&self, flag: StatusFlag) -> bool {
        match flag {
            StatusFlag::I => self.i,
            StatusFlag::T => self.t,
            StatusFlag::H => self.h,
            StatusFlag::S => self.s,
            StatusFlag::V => self.v,
            StatusFlag::N => self.n,
            StatusFlag::Z => self.z,
            StatusFlag::C => self.c,
        }
    }

    /// Writes one flag without any side effects.
    pub const fn set(&mut self, flag: StatusFlag, value: bool) {
        match flag {
            StatusFlag::I => self.i = value,
            StatusFlag::T => self.t = value,
            StatusFlag::H => self.h = value,
            StatusFlag::S => self.s = value,
            StatusFlag::V => self.v = value,
            StatusFlag::N => self.n = value,
            StatusFlag::Z => self.z = value,
            StatusFlag::C => self.c = value,
        }
    }

    /// Composes the `SREG` byte.
    #[must_use]
    pub fn to_byte(&self) -> u8 {
        StatusFlag::ALL
            .iter()
            .filter(|flag| self.get(**flag))
            .fold(0, |acc, flag| acc | (1 << flag.bit()))
    }

    /// Decomposes an `SREG` byte.
    #[must_use]
    pub fn from_byte(value: u8) -> Self {
        let mut sreg = Self::default();
        for flag in StatusFlag::ALL {
            sreg.set(flag, value & (1 << flag.bit()) != 0);
        }
        sreg
    }
}

impl fmt::Display for StatusRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for flag in StatusFlag::ALL.iter().rev() {
            let letter = flag.letter();
            if self.get(*flag) {
                write!(f, "{}", letter.to_ascii_uppercase())?;
            } else {
                write!(f, "{letter}")?;
            }
        }
        Ok(())
    }
}
