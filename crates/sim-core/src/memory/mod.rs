//! Byte segments, flash and the data-space layout.

/// Flash segment with decoded instructions and probe wrappers.
pub mod code;
/// Data-space region map.
pub mod map;
/// Watch-instrumented byte segment.
pub mod segment;

pub use code::{CodeSegment, ProbedInstr, Slot};
pub use map::{DataLayout, DataRegion, IO_BASE, MIN_IO_REGION, SPH_IO, SPL_IO, SREG_IO};
pub use segment::{Segment, Sharer};
