//! Program image handed to [`crate::CodeSegment::load`].

use std::collections::BTreeMap;

use crate::instr::Instr;
use crate::SimError;

/// One entry of a program image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramItem {
    /// Decoded instruction starting at the address.
    Instr(Instr),
    /// Raw flash byte, e.g. constant data read with `LPM`.
    Byte(u8),
}

/// Decoded instructions and raw bytes over an address range of flash.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Program {
    start: u32,
    end: u32,
    instrs: BTreeMap<u32, Instr>,
    bytes: BTreeMap<u32, u8>,
}

impl Program {
    /// Creates an empty image covering `start..end`.
    #[must_use]
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            start,
            end: end.max(start),
            instrs: BTreeMap::new(),
            bytes: BTreeMap::new(),
        }
    }

    /// Lays instructions out back to back from address 0.
    #[must_use]
    pub fn from_instrs(instrs: &[Instr]) -> Self {
        let mut program = Self::default();
        for instr in instrs {
            program.push(*instr);
        }
        program
    }

    /// First address covered by the image.
    #[must_use]
    pub const fn start(&self) -> u32 {
        self.start
    }

    /// Exclusive end address of the image.
    #[must_use]
    pub const fn end(&self) -> u32 {
        self.end
    }

    /// Number of decoded instructions.
    #[must_use]
    pub fn instr_count(&self) -> usize {
        self.instrs.len()
    }

    /// Appends `instr` at the current end and returns its address.
    pub fn push(&mut self, instr: Instr) -> u32 {
        let addr = self.end + self.end % 2;
        self.instrs.insert(addr, instr);
        self.end = addr + instr.size();
        addr
    }

    /// Places `instr` at `addr`, growing the range as needed.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::PcMisaligned`] for an odd address.
    pub fn insert_instr(&mut self, addr: u32, instr: Instr) -> Result<(), SimError> {
        if addr % 2 != 0 {
            return Err(SimError::PcMisaligned { pc: addr });
        }
        self.instrs.insert(addr, instr);
        self.cover(addr, instr.size());
        Ok(())
    }

    /// Places a raw byte at `addr`, growing the range as needed.
    pub fn insert_byte(&mut self, addr: u32, value: u8) {
        self.bytes.insert(addr, value);
        self.cover(addr, 1);
    }

    fn cover(&mut self, addr: u32, size: u32) {
        if self.instrs.len() + self.bytes.len() == 1 && self.start == self.end {
            self.start = addr;
        }
        self.start = self.start.min(addr);
        self.end = self.end.max(addr + size);
    }

    /// Instruction starting at `addr`.
    #[must_use]
    pub fn instr_at(&self, addr: u32) -> Option<Instr> {
        self.instrs.get(&addr).copied()
    }

    /// All entries in address order, instructions before bytes at equal addresses.
    pub fn items(&self) -> impl Iterator<Item = (u32, ProgramItem)> + '_ {
        let instrs = self
            .instrs
            .iter()
            .map(|(addr, instr)| (*addr, ProgramItem::Instr(*instr)));
        let bytes = self
            .bytes
            .iter()
            .map(|(addr, value)| (*addr, ProgramItem::Byte(*value)));
        let mut merged: Vec<_> = instrs.chain(bytes).collect();
        merged.sort_by_key(|(addr, item)| (*addr, matches!(item, ProgramItem::Byte(_))));
        merged.into_iter()
    }
}
