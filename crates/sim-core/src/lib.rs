//! Cycle-accurate simulation core for 8-bit AVR-style microcontrollers.

/// Error taxonomy of the simulation core.
pub mod fault;
pub use fault::{FaultClass, SimError};

/// Public host-facing API contracts: configuration, state view and callbacks.
pub mod api;
pub use api::{
    Event, RunOutcome, SimConfig, State, StateSnapshot, StepOutcome, StopReason,
    VolatileBehavior, DEFAULT_CLOCK_HZ, DEFAULT_FLASH_SIZE, DEFAULT_IO_REGION_SIZE,
    DEFAULT_NUM_INTERRUPTS, DEFAULT_SRAM_SIZE, MAX_INTERRUPTS,
};

/// Instrumentation callbacks and identity-keyed listener lists.
pub mod probe;
pub use probe::{FsmProbe, InterruptProbe, Multicast, Probe, Watch};

/// Byte segments, flash and the data-space layout.
pub mod memory;
pub use memory::{CodeSegment, DataLayout, DataRegion, ProbedInstr, Segment, Sharer, Slot};

/// Decoded instruction subset.
pub mod instr;
pub use instr::{Instr, PointerRegister};

/// Program images.
pub mod program;
pub use program::{Program, ProgramItem};

/// Deterministic instruction cycle-cost table and lookup helpers.
pub mod timing;
pub use timing::{cost_kind, cycle_cost, CycleCostKind, CYCLE_COST_TABLE};

/// Register file, status flags and run-loop state.
pub mod state;
pub use state::{Register, RunState, StatusFlag, StatusRegister};

/// Interrupt bookkeeping.
pub mod interrupts;
pub use interrupts::{AutoClear, InterruptTable, Notification};

/// Cycle counting and event scheduling.
pub mod clock;
pub use clock::{Clock, DeltaQueue, MainClock};

/// Generic finite-state machine for device models.
pub mod fsm;
pub use fsm::{FiniteStateMachine, MachineState, TransitionMatrix, ILLEGAL};

/// Instruction execution pipeline.
pub mod execute;
pub use execute::Interpreter;

/// Per-node façade and cross-thread handle.
pub mod sim;
pub use sim::{SimHandle, Simulator};

/// Multi-node orchestration.
pub mod simulation;
pub use simulation::{NodeId, Simulation};

#[cfg(test)]
use env_logger as _;
#[cfg(test)]
use proptest as _;
#[cfg(test)]
use rstest as _;
