use crate::FaultClass;

/// Coarse run-loop state of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum RunState {
    /// Constructed or paused; the run loop is not executing.
    #[default]
    Idle,
    /// Executing instructions.
    Running,
    /// Halted by `SLEEP` until an enabled interrupt becomes pending.
    Sleeping,
    /// Stopped by request or by `BREAK`.
    Stopped,
    /// Stopped by a fatal error of the given class.
    Faulted(FaultClass),
}

impl RunState {
    /// Returns the fault class when this state is faulted.
    #[must_use]
    pub const fn fault(self) -> Option<FaultClass> {
        match self {
            Self::Faulted(class) => Some(class),
            Self::Idle | Self::Running | Self::Sleeping | Self::Stopped => None,
        }
    }

    /// Returns `true` when the loop may execute further instructions.
    #[must_use]
    pub const fn can_resume(self) -> bool {
        !matches!(self, Self::Faulted(_))
    }
}

#[cfg(test)]
mod tests {
    use super::RunState;
    use crate::FaultClass;

    #[test]
    fn run_state_default_is_idle() {
        assert_eq!(RunState::default(), RunState::Idle);
    }

    #[test]
    fn fault_accessor_reports_only_faulted_variant() {
        assert_eq!(RunState::Running.fault(), None);
        assert_eq!(RunState::Sleeping.fault(), None);
        assert_eq!(
            RunState::Faulted(FaultClass::Instruction).fault(),
            Some(FaultClass::Instruction)
        );
        assert!(!RunState::Faulted(FaultClass::Memory).can_resume());
        assert!(RunState::Stopped.can_resume());
    }
}
