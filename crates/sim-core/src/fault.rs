use thiserror::Error;

/// Fault classes used for reporting and teardown policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum FaultClass {
    /// Flash slot without a decoded instruction.
    Instruction,
    /// Program counter left flash or lost its alignment.
    ProgramCounter,
    /// Strict segment access outside its bounds.
    Memory,
    /// Finite-state-machine model error.
    StateMachine,
    /// Invalid configuration, program image or registration request.
    Setup,
    /// Multi-node orchestration failure.
    Orchestration,
}

/// Errors raised by the simulation core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Error)]
pub enum SimError {
    /// Execution reached a flash address that holds no decoded instruction.
    #[error("no instruction at pc {pc:#06x}")]
    NoSuchInstruction {
        /// Byte address of the empty slot.
        pc: u32,
    },
    /// Program counter points past the end of flash.
    #[error("pc {pc:#06x} is outside flash of {len} bytes")]
    PcOutOfBounds {
        /// Offending program counter.
        pc: u32,
        /// Flash size in bytes.
        len: usize,
    },
    /// Program counter is not on an instruction word boundary.
    #[error("pc {pc:#06x} is not word aligned")]
    PcMisaligned {
        /// Offending program counter.
        pc: u32,
    },
    /// Uninstrumented segment access outside the segment.
    #[error("illegal access of \"{segment}\" at {addr:#06x}{}", pc_suffix(.pc))]
    AddressOutOfBounds {
        /// Segment name.
        segment: String,
        /// Faulting address.
        addr: u32,
        /// Program counter of the faulting instruction, when known.
        pc: Option<u32>,
    },
    /// Requested transition has no legal entry in the transition-time matrix.
    #[error("cannot transition from state {from} -> {to}")]
    IllegalTransition {
        /// Current state.
        from: usize,
        /// Requested state.
        to: usize,
    },
    /// A transition was requested while another one is still in flight.
    #[error("cannot transition to state {requested} while in transition: {from} -> {to}")]
    TransitionInProgress {
        /// Source of the in-flight transition.
        from: usize,
        /// Target of the in-flight transition.
        to: usize,
        /// Newly requested state.
        requested: usize,
    },
    /// Program image does not fit into flash.
    #[error("program ending at {end:#06x} does not fit into {capacity} bytes of flash")]
    ProgramTooLarge {
        /// Exclusive end address of the program image.
        end: u32,
        /// Flash size in bytes.
        capacity: usize,
    },
    /// Interrupt number outside the table.
    #[error("interrupt {inum} is outside the table of {count} interrupts")]
    InterruptOutOfRange {
        /// Offending interrupt number.
        inum: u8,
        /// Number of interrupts in the table.
        count: u8,
    },
    /// Address is not backed by a volatile slot.
    #[error("address {addr:#06x} is not an i/o register")]
    NotVolatile {
        /// Offending data address.
        addr: u32,
    },
    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// Orchestrator was asked about an unknown node.
    #[error("node {id} is not part of the simulation")]
    NodeMissing {
        /// Node identifier.
        id: u32,
    },
    /// A node's execution thread panicked.
    #[error("node {id} panicked while running")]
    NodePanicked {
        /// Node identifier.
        id: u32,
    },
}

#[allow(clippy::ref_option)]
fn pc_suffix(pc: &Option<u32>) -> String {
    pc.map_or_else(String::new, |pc| format!(" (pc {pc:#06x})"))
}

impl SimError {
    /// Returns the fault class for this error.
    #[must_use]
    pub const fn class(&self) -> FaultClass {
        match self {
            Self::NoSuchInstruction { .. } => FaultClass::Instruction,
            Self::PcOutOfBounds { .. } | Self::PcMisaligned { .. } => FaultClass::ProgramCounter,
            Self::AddressOutOfBounds { .. } => FaultClass::Memory,
            Self::IllegalTransition { .. } | Self::TransitionInProgress { .. } => {
                FaultClass::StateMachine
            }
            Self::ProgramTooLarge { .. }
            | Self::InterruptOutOfRange { .. }
            | Self::NotVolatile { .. }
            | Self::InvalidConfig(_) => FaultClass::Setup,
            Self::NodeMissing { .. } | Self::NodePanicked { .. } => FaultClass::Orchestration,
        }
    }

    /// Errors that tear down the node's run loop.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self.class(),
            FaultClass::Instruction
                | FaultClass::ProgramCounter
                | FaultClass::Memory
                | FaultClass::StateMachine
        )
    }

    /// Attaches the faulting program counter to an address error.
    #[must_use]
    pub fn at_pc(self, faulting_pc: u32) -> Self {
        match self {
            Self::AddressOutOfBounds { segment, addr, .. } => Self::AddressOutOfBounds {
                segment,
                addr,
                pc: Some(faulting_pc),
            },
            other => other,
        }
    }
}
