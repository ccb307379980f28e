//! Register file, status flags and run-loop state.

/// General-purpose register and status-flag types.
pub mod registers;
/// Node run-loop state.
pub mod run_state;

pub use registers::{Register, StatusFlag, StatusRegister, NUM_REGS};
pub use run_state::RunState;
