//! Public host-facing API contracts for embedding the simulation core.

use crate::instr::Instr;
use crate::memory::map::{DataLayout, IO_BASE, MIN_IO_REGION};
use crate::state::{Register, StatusFlag, StatusRegister, NUM_REGS};
use crate::SimError;

/// Default number of I/O registers (ATmega128 without extended I/O).
pub const DEFAULT_IO_REGION_SIZE: u32 = 64;
/// Default RAM size in bytes.
pub const DEFAULT_SRAM_SIZE: u32 = 4096;
/// Default flash size in bytes.
pub const DEFAULT_FLASH_SIZE: u32 = 128 * 1024;
/// Default number of interrupt vectors, including the reset vector.
pub const DEFAULT_NUM_INTERRUPTS: u8 = 35;
/// Default main clock frequency (Mica2 node).
pub const DEFAULT_CLOCK_HZ: u64 = 7_372_800;
/// Upper bound on interrupt vectors, fixed by the 64-bit interrupt masks.
pub const MAX_INTERRUPTS: u8 = 64;
/// Largest data space the 16-bit stack pointer can address.
const MAX_DATA_SPACE: u32 = 1 << 16;

/// Top-level immutable configuration for one simulated node.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct SimConfig {
    /// Node identifier reported by [`crate::Simulator::id`].
    pub node_id: u32,
    /// Number of memory-mapped I/O registers after the register file.
    pub io_region_size: u32,
    /// Plain RAM size in bytes.
    pub sram_size: u32,
    /// Flash size in bytes.
    pub flash_size: u32,
    /// Number of interrupt vectors, reset included.
    pub num_interrupts: u8,
    /// Byte address of vector 1.
    pub interrupt_base: u32,
    /// Distance in bytes between consecutive vectors.
    pub interrupt_vector_size: u32,
    /// Value returned by out-of-range instrumented data reads.
    pub sram_fill: u8,
    /// Value of unprogrammed flash bytes.
    pub flash_fill: u8,
    /// Main clock frequency in hertz.
    pub clock_hz: u64,
    /// Program counter after reset.
    pub boot_pc: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            node_id: 0,
            io_region_size: DEFAULT_IO_REGION_SIZE,
            sram_size: DEFAULT_SRAM_SIZE,
            flash_size: DEFAULT_FLASH_SIZE,
            num_interrupts: DEFAULT_NUM_INTERRUPTS,
            interrupt_base: 0,
            interrupt_vector_size: 4,
            sram_fill: 0,
            flash_fill: 0xFF,
            clock_hz: DEFAULT_CLOCK_HZ,
            boot_pc: 0,
        }
    }
}

impl SimConfig {
    /// Data-space layout derived from this configuration.
    #[must_use]
    pub const fn layout(&self) -> DataLayout {
        DataLayout::new(self.io_region_size, self.sram_size)
    }

    /// Byte address of the vector for `inum`.
    #[must_use]
    pub fn vector_address(&self, inum: u8) -> u32 {
        u32::from(inum)
            .saturating_sub(1)
            .saturating_mul(self.interrupt_vector_size)
            .saturating_add(self.interrupt_base)
    }

    /// Checks that the layout can be simulated.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`] describing the first rejected field.
    pub fn validate(&self) -> Result<(), SimError> {
        if self.io_region_size < MIN_IO_REGION {
            return Err(SimError::InvalidConfig(format!(
                "io_region_size {} leaves no room for SREG, SPH and SPL (need {MIN_IO_REGION})",
                self.io_region_size
            )));
        }
        if self.num_interrupts == 0 || self.num_interrupts > MAX_INTERRUPTS {
            return Err(SimError::InvalidConfig(format!(
                "num_interrupts must be within 1..={MAX_INTERRUPTS}, got {}",
                self.num_interrupts
            )));
        }
        let data_space = IO_BASE
            .checked_add(self.io_region_size)
            .and_then(|start| start.checked_add(self.sram_size));
        if !data_space.is_some_and(|len| len <= MAX_DATA_SPACE) {
            return Err(SimError::InvalidConfig(format!(
                "io_region_size {} plus sram_size {} exceeds the {MAX_DATA_SPACE:#x}-byte data space",
                self.io_region_size, self.sram_size
            )));
        }
        if self.flash_size == 0 || self.flash_size % 2 != 0 {
            return Err(SimError::InvalidConfig(format!(
                "flash_size must be a positive even number of bytes, got {}",
                self.flash_size
            )));
        }
        if self.interrupt_vector_size == 0 || self.interrupt_vector_size % 2 != 0 {
            return Err(SimError::InvalidConfig(format!(
                "interrupt_vector_size must be a positive even number, got {}",
                self.interrupt_vector_size
            )));
        }
        let last_vector = u32::from(self.num_interrupts - 1)
            .checked_mul(self.interrupt_vector_size)
            .and_then(|offset| offset.checked_add(self.interrupt_base));
        if last_vector.is_none() {
            return Err(SimError::InvalidConfig(format!(
                "interrupt_base {:#06x} puts the vector table past the address space",
                self.interrupt_base
            )));
        }
        if self.boot_pc % 2 != 0 || self.boot_pc >= self.flash_size {
            return Err(SimError::InvalidConfig(format!(
                "boot_pc {:#06x} is not an instruction address inside flash",
                self.boot_pc
            )));
        }
        Ok(())
    }
}

/// Read-only view of one node handed to every instrumentation callback.
pub trait State {
    /// Address of the instruction being executed.
    fn pc(&self) -> u32;

    /// Stack pointer composed from `SPH:SPL`.
    fn sp(&self) -> u16;

    /// Clock cycles elapsed since the node started.
    fn cycles(&self) -> u64;

    /// Current value of a general-purpose register.
    fn register(&self, reg: Register) -> u8;

    /// Composed status register.
    fn sreg(&self) -> u8;

    /// One status flag.
    fn flag(&self, flag: StatusFlag) -> bool {
        self.sreg() & (1 << flag.bit()) != 0
    }

    /// Raw data-space byte without watches or volatile dispatch.
    fn data_byte(&self, addr: u32) -> Option<u8>;

    /// Raw flash byte.
    fn program_byte(&self, addr: u32) -> Option<u8>;

    /// Original instruction stored at a flash address, ignoring probes.
    fn instr(&self, addr: u32) -> Option<Instr>;

    /// Returns `true` while the node sleeps.
    fn is_sleeping(&self) -> bool;
}

/// Plain copy of the register-level state of a node.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct StateSnapshot {
    /// Program counter.
    pub pc: u32,
    /// Stack pointer.
    pub sp: u16,
    /// Elapsed cycles.
    pub cycles: u64,
    /// General-purpose registers.
    pub registers: [u8; NUM_REGS],
    /// Status flags.
    pub sreg: StatusRegister,
    /// Sleep mode flag.
    pub sleeping: bool,
}

impl StateSnapshot {
    /// Copies the register-level state of any [`State`].
    #[must_use]
    pub fn capture(state: &dyn State) -> Self {
        let mut registers = [0; NUM_REGS];
        for reg in Register::ALL {
            registers[reg.index()] = state.register(reg);
        }
        Self {
            pc: state.pc(),
            sp: state.sp(),
            cycles: state.cycles(),
            registers,
            sreg: StatusRegister::from_byte(state.sreg()),
            sleeping: state.is_sleeping(),
        }
    }
}

impl State for StateSnapshot {
    fn pc(&self) -> u32 {
        self.pc
    }

    fn sp(&self) -> u16 {
        self.sp
    }

    fn cycles(&self) -> u64 {
        self.cycles
    }

    fn register(&self, reg: Register) -> u8 {
        self.registers[reg.index()]
    }

    fn sreg(&self) -> u8 {
        self.sreg.to_byte()
    }

    fn data_byte(&self, addr: u32) -> Option<u8> {
        usize::try_from(addr)
            .ok()
            .and_then(|index| self.registers.get(index).copied())
    }

    fn program_byte(&self, _addr: u32) -> Option<u8> {
        None
    }

    fn instr(&self, _addr: u32) -> Option<Instr> {
        None
    }

    fn is_sleeping(&self) -> bool {
        self.sleeping
    }
}

/// Pluggable semantics of a memory-mapped I/O address.
///
/// `current` is the value last stored through this behavior.
pub trait VolatileBehavior: Send {
    /// Produces the value seen by a read.
    fn read(&mut self, current: u8) -> u8 {
        current
    }

    /// Consumes a write and returns the value to store.
    fn write(&mut self, current: u8, value: u8) -> u8 {
        let _ = current;
        value
    }
}

/// One-shot callback scheduled on a clock.
pub trait Event: Send + Sync {
    /// Runs when the scheduled cycle is reached.
    fn fire(&self);
}

impl<F> Event for F
where
    F: Fn() + Send + Sync,
{
    fn fire(&self) {
        (self)();
    }
}

/// Result of one [`crate::Simulator::step`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepOutcome {
    /// One instruction executed and committed.
    Retired {
        /// Address of the retired instruction.
        pc: u32,
        /// Cycles consumed by the instruction.
        cycles: u64,
    },
    /// Control transferred to an interrupt vector.
    Interrupted {
        /// Delivered interrupt number.
        inum: u8,
    },
    /// Node slept until the next clock event.
    Slept {
        /// Cycles skipped.
        cycles: u64,
    },
    /// Queued pipeline delay was consumed before the next instruction.
    Delayed {
        /// Cycles consumed.
        cycles: u64,
    },
    /// `BREAK` executed; the run loop stops.
    Break {
        /// Address of the `BREAK` instruction.
        pc: u32,
    },
    /// A stop request was observed at the boundary.
    Stopped,
}

/// Why [`crate::Simulator::start`] returned without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// [`crate::SimHandle::stop`] or [`crate::Simulator::stop`] was called.
    Requested,
    /// The program executed `BREAK`.
    Break,
}

/// Aggregated outcome of one run-loop invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunOutcome {
    /// Instructions retired during this run.
    pub instructions: u64,
    /// Interrupts delivered during this run.
    pub interrupts: u64,
    /// Clock count when the loop returned.
    pub cycles: u64,
    /// Reason the loop ended.
    pub reason: StopReason,
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::{SimConfig, State, StateSnapshot, DEFAULT_NUM_INTERRUPTS};
    use crate::state::{Register, StatusFlag, StatusRegister};
    use crate::SimError;

    #[test]
    fn default_config_validates() {
        let config = SimConfig::default();
        assert_eq!(config.num_interrupts, DEFAULT_NUM_INTERRUPTS);
        assert_eq!(config.flash_fill, 0xFF);
        assert!(config.validate().is_ok());
        assert_eq!(config.layout().sram_start(), 96);
    }

    #[test]
    fn vector_address_steps_by_vector_size_from_vector_one() {
        let config = SimConfig {
            interrupt_base: 0x100,
            ..SimConfig::default()
        };
        assert_eq!(config.vector_address(1), 0x100);
        assert_eq!(config.vector_address(5), 0x110);
    }

    #[test]
    fn validation_rejects_small_io_region() {
        let config = SimConfig {
            io_region_size: 32,
            ..SimConfig::default()
        };
        assert!(matches!(config.validate(), Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn validation_rejects_interrupt_count_beyond_mask_width() {
        let config = SimConfig {
            num_interrupts: 65,
            ..SimConfig::default()
        };
        assert!(config.validate().is_err());
        let config = SimConfig {
            num_interrupts: 0,
            ..SimConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::sram_overflow(SimConfig { sram_size: u32::MAX, ..SimConfig::default() })]
    #[case::io_overflow(SimConfig { io_region_size: u32::MAX - 8, ..SimConfig::default() })]
    #[case::beyond_stack_pointer(SimConfig { sram_size: 0x1_0000, ..SimConfig::default() })]
    #[case::vector_table_overflow(SimConfig { interrupt_base: u32::MAX - 2, ..SimConfig::default() })]
    fn validation_rejects_layouts_that_overflow_addresses(#[case] config: SimConfig) {
        assert!(matches!(config.validate(), Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn vector_address_saturates_instead_of_wrapping() {
        let config = SimConfig {
            interrupt_base: u32::MAX - 2,
            ..SimConfig::default()
        };
        assert_eq!(config.vector_address(2), u32::MAX);
    }

    #[test]
    fn validation_rejects_odd_boot_pc() {
        let config = SimConfig {
            boot_pc: 3,
            ..SimConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn snapshot_state_reports_registers_and_flags() {
        let mut snapshot = StateSnapshot::default();
        snapshot.registers[Register::R16.index()] = 0x42;
        snapshot.sreg = StatusRegister::from_byte(0x82);

        assert_eq!(snapshot.register(Register::R16), 0x42);
        assert_eq!(snapshot.data_byte(16), Some(0x42));
        assert_eq!(snapshot.data_byte(32), None);
        assert!(snapshot.flag(StatusFlag::I));
        assert!(snapshot.flag(StatusFlag::Z));
        assert!(!snapshot.flag(StatusFlag::C));
        assert_eq!(StateSnapshot::capture(&snapshot), snapshot);
    }
}
