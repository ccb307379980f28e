//! Data-space layout: register file, I/O registers, then plain RAM.

use crate::state::NUM_REGS;

/// Data address of the first I/O register.
pub const IO_BASE: u32 = 32;
/// I/O index of the status register.
pub const SREG_IO: u32 = 0x3F;
/// I/O index of the stack pointer high byte.
pub const SPH_IO: u32 = 0x3E;
/// I/O index of the stack pointer low byte.
pub const SPL_IO: u32 = 0x3D;
/// Smallest I/O region that still holds `SREG`, `SPH` and `SPL`.
pub const MIN_IO_REGION: u32 = SREG_IO + 1;

/// Region classification for data-space addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataRegion {
    /// General-purpose registers (`0..32`).
    Registers,
    /// Memory-mapped I/O registers, dispatched through volatile behaviors.
    Io,
    /// Plain RAM at and above `sram_start`.
    Sram,
    /// Outside the data space.
    Outside,
}

/// Sizes and derived boundaries of one node's data space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DataLayout {
    io_region_size: u32,
    sram_size: u32,
}

impl DataLayout {
    /// Creates a layout with the given I/O region and RAM sizes.
    #[must_use]
    pub const fn new(io_region_size: u32, sram_size: u32) -> Self {
        Self {
            io_region_size,
            sram_size,
        }
    }

    /// Number of I/O registers.
    #[must_use]
    pub const fn io_region_size(&self) -> u32 {
        self.io_region_size
    }

    /// RAM size in bytes.
    #[must_use]
    pub const fn sram_size(&self) -> u32 {
        self.sram_size
    }

    /// First plain-RAM address; everything below is volatile.
    #[must_use]
    pub const fn sram_start(&self) -> u32 {
        IO_BASE + self.io_region_size
    }

    /// Total data-space length in bytes.
    #[must_use]
    pub const fn len(&self) -> u32 {
        self.sram_start() + self.sram_size
    }

    /// Returns `true` for a layout without any addressable byte.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Data address of an I/O register index.
    #[must_use]
    pub const fn io_to_data(io: u32) -> u32 {
        IO_BASE + io
    }

    /// Data address of `SREG`.
    #[must_use]
    pub const fn sreg_addr(&self) -> u32 {
        Self::io_to_data(SREG_IO)
    }

    /// Data address of `SPL`.
    #[must_use]
    pub const fn spl_addr(&self) -> u32 {
        Self::io_to_data(SPL_IO)
    }

    /// Data address of `SPH`.
    #[must_use]
    pub const fn sph_addr(&self) -> u32 {
        Self::io_to_data(SPH_IO)
    }

    /// Highest RAM address, the conventional initial stack pointer.
    #[must_use]
    pub const fn ramend(&self) -> u32 {
        self.len().saturating_sub(1)
    }

    /// Classifies a data address.
    #[must_use]
    pub const fn region(&self, addr: u32) -> DataRegion {
        if addr < IO_BASE {
            DataRegion::Registers
        } else if addr < self.sram_start() {
            DataRegion::Io
        } else if addr < self.len() {
            DataRegion::Sram
        } else {
            DataRegion::Outside
        }
    }
}

const _: () = {
    assert!(SPL_IO < SPH_IO && SPH_IO < SREG_IO);
    assert!(MIN_IO_REGION == 64);
    assert!(IO_BASE as usize == NUM_REGS);
};

#[cfg(test)]
mod tests {
    use super::{DataLayout, DataRegion, IO_BASE};

    #[test]
    fn sram_start_follows_register_file_and_io_region() {
        let layout = DataLayout::new(64, 4096);
        assert_eq!(layout.sram_start(), 96);
        assert_eq!(layout.len(), 96 + 4096);
        assert_eq!(layout.ramend(), 0x105F);
    }

    #[test]
    fn fixed_io_registers_map_into_data_space() {
        let layout = DataLayout::new(64, 16);
        assert_eq!(layout.sreg_addr(), 0x5F);
        assert_eq!(layout.sph_addr(), 0x5E);
        assert_eq!(layout.spl_addr(), 0x5D);
        assert_eq!(DataLayout::io_to_data(0), IO_BASE);
    }

    #[test]
    fn region_boundaries_are_half_open() {
        let layout = DataLayout::new(64, 16);
        assert_eq!(layout.region(31), DataRegion::Registers);
        assert_eq!(layout.region(32), DataRegion::Io);
        assert_eq!(layout.region(95), DataRegion::Io);
        assert_eq!(layout.region(96), DataRegion::Sram);
        assert_eq!(layout.region(111), DataRegion::Sram);
        assert_eq!(layout.region(112), DataRegion::Outside);
    }
}
