use std::fmt;
use std::sync::Arc;

use log::debug;

use crate::instr::Instr;
use crate::memory::Segment;
use crate::probe::{Multicast, Probe};
use crate::program::{Program, ProgramItem};
use crate::SimError;

/// Instruction wrapper installed while at least one probe watches an address.
pub struct ProbedInstr {
    original: Option<Instr>,
    address: u32,
    probes: Multicast<dyn Probe>,
}

impl ProbedInstr {
    /// Wrapped instruction, `None` when the slot held no instruction.
    #[must_use]
    pub const fn original(&self) -> Option<Instr> {
        self.original
    }

    /// Flash address of the wrapped slot.
    #[must_use]
    pub const fn address(&self) -> u32 {
        self.address
    }

    /// Number of attached probes.
    #[must_use]
    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }
}

impl fmt::Debug for ProbedInstr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbedInstr")
            .field("original", &self.original)
            .field("address", &self.address)
            .field("probes", &self.probes.len())
            .finish()
    }
}

/// Contents of one flash slot.
#[derive(Debug, Default)]
pub enum Slot {
    /// No instruction starts here.
    #[default]
    Empty,
    /// Bare decoded instruction.
    Instr(Instr),
    /// Instruction (or empty slot) observed by probes.
    Probed(Box<ProbedInstr>),
}

impl Slot {
    /// Instruction this slot executes, looking through a probe wrapper.
    #[must_use]
    pub const fn instr(&self) -> Option<Instr> {
        match self {
            Self::Empty => None,
            Self::Instr(instr) => Some(*instr),
            Self::Probed(probed) => probed.original,
        }
    }

    fn from_instr(instr: Option<Instr>) -> Self {
        instr.map_or(Self::Empty, Self::Instr)
    }
}

/// What the interpreter found at a program counter.
pub(crate) enum Fetched {
    Plain(Instr),
    Probed {
        instr: Option<Instr>,
        probes: Arc<[Arc<dyn Probe>]>,
    },
}

/// Flash: raw bytes plus the decoded instruction table.
pub struct CodeSegment {
    segment: Segment,
    slots: Vec<Slot>,
}

impl CodeSegment {
    /// Creates an erased flash of `len` bytes.
    #[must_use]
    pub fn new(name: impl Into<String>, len: usize, default_value: u8) -> Self {
        let mut slots = Vec::with_capacity(len);
        slots.resize_with(len, Slot::default);
        Self {
            segment: Segment::new(name, len, default_value),
            slots,
        }
    }

    /// Underlying byte segment.
    #[must_use]
    pub const fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Flash size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` for a zero-sized flash.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn index(&self, addr: u32) -> Option<usize> {
        usize::try_from(addr)
            .ok()
            .filter(|index| *index < self.slots.len())
    }

    fn out_of_bounds(&self, addr: u32) -> SimError {
        SimError::AddressOutOfBounds {
            segment: self.segment.name().to_owned(),
            addr,
            pc: None,
        }
    }

    /// Replaces the whole flash contents with a program image.
    ///
    /// Slots where no instruction starts hold [`Slot::Empty`]; the walk advances by
    /// the instruction size where one starts and by one word otherwise. Probes
    /// attached before the load are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::ProgramTooLarge`] when the image ends past the flash.
    pub fn load(&mut self, program: &Program) -> Result<(), SimError> {
        let capacity = self.slots.len();
        let fits = usize::try_from(program.end()).is_ok_and(|end| end <= capacity);
        if !fits {
            return Err(SimError::ProgramTooLarge {
                end: program.end(),
                capacity,
            });
        }

        for slot in &mut self.slots {
            *slot = Slot::Empty;
        }
        let fill = self.segment.default_value();
        self.segment.bytes_mut().fill(fill);

        // Instructions are word aligned even when the image opens on an odd byte.
        let mut addr = program.start() & !1;
        let mut placed = 0usize;
        while addr < program.end() {
            match program.instr_at(addr) {
                Some(instr) => {
                    self.slots[addr as usize] = Slot::Instr(instr);
                    placed += 1;
                    addr += instr.size();
                }
                None => addr += 2,
            }
        }
        for (addr, item) in program.items() {
            if let ProgramItem::Byte(value) = item {
                self.segment.set(addr, value)?;
            }
        }
        debug!(
            "loaded {placed} instructions into \"{}\" ({:#06x}..{:#06x})",
            self.segment.name(),
            program.start(),
            program.end()
        );
        Ok(())
    }

    /// Slot at `addr`.
    #[must_use]
    pub fn slot(&self, addr: u32) -> Option<&Slot> {
        self.index(addr).map(|index| &self.slots[index])
    }

    /// Original instruction at `addr`, looking through any probe wrapper.
    #[must_use]
    pub fn read_instr(&self, addr: u32) -> Option<Instr> {
        self.slot(addr).and_then(Slot::instr)
    }

    /// Returns `true` when a probe wrapper is installed at `addr`.
    #[must_use]
    pub fn is_probed(&self, addr: u32) -> bool {
        matches!(self.slot(addr), Some(Slot::Probed(_)))
    }

    /// Replaces the instruction at `addr`, keeping attached probes.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::AddressOutOfBounds`] when `addr` is outside flash.
    pub fn write_instr(&mut self, addr: u32, instr: Option<Instr>) -> Result<(), SimError> {
        let index = self.index(addr).ok_or_else(|| self.out_of_bounds(addr))?;
        match &mut self.slots[index] {
            Slot::Probed(probed) => probed.original = instr,
            slot => *slot = Slot::from_instr(instr),
        }
        Ok(())
    }

    /// Attaches `probe` to the instruction at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::AddressOutOfBounds`] when `addr` is outside flash.
    pub fn insert_probe(&mut self, addr: u32, probe: Arc<dyn Probe>) -> Result<(), SimError> {
        let index = self.index(addr).ok_or_else(|| self.out_of_bounds(addr))?;
        let slot = &mut self.slots[index];
        if let Slot::Probed(probed) = slot {
            probed.probes.add(probe);
            return Ok(());
        }
        let mut probes = Multicast::new();
        probes.add(probe);
        *slot = Slot::Probed(Box::new(ProbedInstr {
            original: slot.instr(),
            address: addr,
            probes,
        }));
        Ok(())
    }

    /// Detaches `probe` from `addr`; the wrapper disappears with its last probe.
    ///
    /// Returns `false` when `probe` was not attached there.
    pub fn remove_probe(&mut self, addr: u32, probe: &Arc<dyn Probe>) -> bool {
        let Some(index) = self.index(addr) else {
            return false;
        };
        let slot = &mut self.slots[index];
        let Slot::Probed(probed) = slot else {
            return false;
        };
        if !probed.probes.remove(probe) {
            return false;
        }
        if probed.probes.is_empty() {
            *slot = Slot::from_instr(probed.original);
        }
        true
    }

    /// Number of probes attached at `addr`.
    #[must_use]
    pub fn probe_count(&self, addr: u32) -> usize {
        match self.slot(addr) {
            Some(Slot::Probed(probed)) => probed.probe_count(),
            _ => 0,
        }
    }

    pub(crate) fn fetch(&self, pc: u32) -> Result<Fetched, SimError> {
        if pc % 2 != 0 {
            return Err(SimError::PcMisaligned { pc });
        }
        let slot = self.slot(pc).ok_or(SimError::PcOutOfBounds {
            pc,
            len: self.slots.len(),
        })?;
        match slot {
            Slot::Empty => Err(SimError::NoSuchInstruction { pc }),
            Slot::Instr(instr) => Ok(Fetched::Plain(*instr)),
            Slot::Probed(probed) => Ok(Fetched::Probed {
                instr: probed.original,
                probes: probed.probes.snapshot(),
            }),
        }
    }
}

impl fmt::Debug for CodeSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeSegment")
            .field("segment", &self.segment)
            .field(
                "probed",
                &self
                    .slots
                    .iter()
                    .filter(|slot| matches!(slot, Slot::Probed(_)))
                    .count(),
            )
            .finish()
    }
}
