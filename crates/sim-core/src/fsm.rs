//! Timed finite state machines for peripheral device models.
//!
//! A machine moves between named states according to a transition-time matrix:
//! entry `[from][to]` is the number of clock cycles the move takes, and a negative
//! entry forbids it. Zero-cost moves complete inside [`FiniteStateMachine::transition`];
//! anything longer parks the machine in [`MachineState::InTransition`] and schedules a
//! one-shot event on the driving clock that completes it.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::trace;

use crate::clock::Clock;
use crate::probe::{FsmProbe, Multicast};
use crate::{Event, SimError};

/// Entry marking a forbidden transition.
pub const ILLEGAL: i64 = -1;

/// Current position of a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum MachineState {
    /// Resting in a state.
    At(usize),
    /// A timed transition is in flight.
    InTransition {
        /// State being left.
        from: usize,
        /// State being entered.
        to: usize,
    },
}

impl MachineState {
    /// Resting state, `None` while in transition.
    #[must_use]
    pub const fn state(self) -> Option<usize> {
        match self {
            Self::At(state) => Some(state),
            Self::InTransition { .. } => None,
        }
    }

    /// Returns `true` while a timed transition is in flight.
    #[must_use]
    pub const fn is_in_transition(self) -> bool {
        matches!(self, Self::InTransition { .. })
    }
}

/// Square matrix of transition costs in cycles.
///
/// Rows are reference counted so that [`TransitionMatrix::sparse`] can share a single
/// row between every state; [`TransitionMatrix::set`] copies a shared row before
/// changing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionMatrix {
    rows: Vec<Arc<[i64]>>,
}

impl TransitionMatrix {
    /// Matrix where every transition, self-transitions included, costs `cost`.
    #[must_use]
    pub fn uniform(size: usize, cost: i64) -> Self {
        Self {
            rows: (0..size).map(|_| Arc::from(vec![cost; size])).collect(),
        }
    }

    /// Same contents as [`TransitionMatrix::uniform`], backed by one shared row.
    #[must_use]
    pub fn sparse(size: usize, cost: i64) -> Self {
        let row: Arc<[i64]> = Arc::from(vec![cost; size]);
        Self {
            rows: vec![row; size],
        }
    }

    /// Matrix without any legal transition.
    #[must_use]
    pub fn illegal(size: usize) -> Self {
        Self::uniform(size, ILLEGAL)
    }

    /// Two-mode machine: every state may move to and from `hub`, and nowhere else.
    ///
    /// `to_hub[i]` is the cost of `i -> hub`, `from_hub[i]` the cost of `hub -> i`.
    /// Missing entries are illegal.
    #[must_use]
    pub fn bimodal(size: usize, hub: usize, to_hub: &[i64], from_hub: &[i64]) -> Self {
        let mut matrix = Self::illegal(size);
        for state in 0..size {
            matrix.set(state, hub, to_hub.get(state).copied().unwrap_or(ILLEGAL));
            matrix.set(hub, state, from_hub.get(state).copied().unwrap_or(ILLEGAL));
        }
        matrix
    }

    /// Cyclic machine visiting the states in `order`, wrapping around.
    ///
    /// `entry_costs[s]` is the cost of the edge that enters state `s`.
    #[must_use]
    pub fn ring(order: &[usize], entry_costs: &[i64]) -> Self {
        let mut matrix = Self::illegal(order.len());
        for (position, &from) in order.iter().enumerate() {
            let to = order[(position + 1) % order.len()];
            matrix.set(from, to, entry_costs.get(to).copied().unwrap_or(ILLEGAL));
        }
        matrix
    }

    /// Number of states.
    #[must_use]
    pub fn size(&self) -> usize {
        self.rows.len()
    }

    /// Cost of `from -> to`, `None` outside the matrix.
    #[must_use]
    pub fn get(&self, from: usize, to: usize) -> Option<i64> {
        self.rows.get(from).and_then(|row| row.get(to)).copied()
    }

    /// Overwrites one entry; returns `false` outside the matrix.
    pub fn set(&mut self, from: usize, to: usize, cost: i64) -> bool {
        let size = self.rows.len();
        let Some(row) = self.rows.get_mut(from) else {
            return false;
        };
        if to >= size {
            return false;
        }
        let mut owned = row.to_vec();
        owned[to] = cost;
        *row = owned.into();
        true
    }

    /// Overwrites every self-transition.
    #[must_use]
    pub fn set_diagonal(mut self, cost: i64) -> Self {
        for state in 0..self.rows.len() {
            self.set(state, state, cost);
        }
        self
    }

    /// Returns `true` when two rows share storage.
    #[must_use]
    pub fn shares_rows(&self, first: usize, second: usize) -> bool {
        match (self.rows.get(first), self.rows.get(second)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

struct Machine {
    current: MachineState,
    global_probes: Multicast<dyn FsmProbe>,
    state_probes: Vec<Multicast<dyn FsmProbe>>,
}

impl Machine {
    /// Probe lists in firing order: old state, new state, global.
    fn listeners(&self, from: usize, to: usize) -> [Arc<[Arc<dyn FsmProbe>]>; 3] {
        [
            self.state_probes[from].snapshot(),
            self.state_probes[to].snapshot(),
            self.global_probes.snapshot(),
        ]
    }
}

fn fire_before(listeners: &[Arc<[Arc<dyn FsmProbe>]>; 3], from: usize, to: usize) {
    for probe in listeners.iter().flat_map(|list| list.iter()) {
        probe.fire_before_transition(from, to);
    }
}

fn fire_after(listeners: &[Arc<[Arc<dyn FsmProbe>]>; 3], from: usize, to: usize) {
    for probe in listeners.iter().flat_map(|list| list.iter()) {
        probe.fire_after_transition(from, to);
    }
}

fn lock(machine: &Mutex<Machine>) -> MutexGuard<'_, Machine> {
    machine.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clock event that completes one timed transition.
struct TransitionEvent {
    machine: Weak<Mutex<Machine>>,
    from: usize,
    to: usize,
}

impl Event for TransitionEvent {
    fn fire(&self) {
        let Some(machine) = self.machine.upgrade() else {
            return;
        };
        let listeners = {
            let mut machine = lock(&machine);
            machine.current = MachineState::At(self.to);
            machine.listeners(self.from, self.to)
        };
        trace!("fsm transition {} -> {} completed", self.from, self.to);
        fire_after(&listeners, self.from, self.to);
    }
}

/// Named-state automaton driven by a clock.
///
/// Clones share the same machine.
#[derive(Clone)]
pub struct FiniteStateMachine {
    names: Arc<[String]>,
    matrix: Arc<TransitionMatrix>,
    start: usize,
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<Machine>>,
}

impl FiniteStateMachine {
    /// Creates a machine resting in `start`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`] when the matrix size differs from the number
    /// of names or `start` is not a state.
    pub fn new<S: Into<String>>(
        clock: Arc<dyn Clock>,
        start: usize,
        names: impl IntoIterator<Item = S>,
        matrix: TransitionMatrix,
    ) -> Result<Self, SimError> {
        let names: Arc<[String]> = names.into_iter().map(Into::into).collect();
        if names.len() != matrix.size() {
            return Err(SimError::InvalidConfig(format!(
                "{} state names for a {}x{} transition matrix",
                names.len(),
                matrix.size(),
                matrix.size()
            )));
        }
        if start >= names.len() {
            return Err(SimError::InvalidConfig(format!(
                "start state {start} is not one of {} states",
                names.len()
            )));
        }
        let state_probes = vec![Multicast::new(); names.len()];
        Ok(Self {
            names,
            matrix: Arc::new(matrix),
            start,
            clock,
            inner: Arc::new(Mutex::new(Machine {
                current: MachineState::At(start),
                global_probes: Multicast::new(),
                state_probes,
            })),
        })
    }

    /// Number of states.
    #[must_use]
    pub fn num_states(&self) -> usize {
        self.names.len()
    }

    /// State the machine was created in.
    #[must_use]
    pub const fn start_state(&self) -> usize {
        self.start
    }

    /// Current position.
    #[must_use]
    pub fn current_state(&self) -> MachineState {
        lock(&self.inner).current
    }

    /// Name of `state`.
    #[must_use]
    pub fn state_name(&self, state: usize) -> Option<&str> {
        self.names.get(state).map(String::as_str)
    }

    /// Name of the resting state, `None` while in transition.
    #[must_use]
    pub fn current_state_name(&self) -> Option<&str> {
        self.current_state()
            .state()
            .and_then(|state| self.state_name(state))
    }

    /// Cost of `from -> to`; negative when forbidden, `None` outside the machine.
    #[must_use]
    pub fn transition_time(&self, from: usize, to: usize) -> Option<i64> {
        self.matrix.get(from, to)
    }

    /// Clock driving timed transitions.
    #[must_use]
    pub const fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Starts a move to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::TransitionInProgress`] while a timed transition is in flight
    /// and [`SimError::IllegalTransition`] when the move is forbidden or `to` is not a
    /// state. Nothing fires in either case. Before-probes observe the machine already
    /// in transition.
    pub fn transition(&self, to: usize) -> Result<(), SimError> {
        let (from, cost, listeners) = {
            let mut machine = lock(&self.inner);
            let from = match machine.current {
                MachineState::InTransition { from, to: target } => {
                    return Err(SimError::TransitionInProgress {
                        from,
                        to: target,
                        requested: to,
                    });
                }
                MachineState::At(from) => from,
            };
            let cost = self
                .matrix
                .get(from, to)
                .and_then(|cost| u64::try_from(cost).ok())
                .ok_or(SimError::IllegalTransition { from, to })?;
            // Claimed before any callback runs so a nested or concurrent request is refused.
            machine.current = MachineState::InTransition { from, to };
            (from, cost, machine.listeners(from, to))
        };

        fire_before(&listeners, from, to);

        if cost == 0 {
            lock(&self.inner).current = MachineState::At(to);
            trace!("fsm transition {from} -> {to} completed immediately");
            fire_after(&listeners, from, to);
            return Ok(());
        }

        trace!("fsm transition {from} -> {to} scheduled in {cost} cycles");
        self.clock.insert_event(
            Arc::new(TransitionEvent {
                machine: Arc::downgrade(&self.inner),
                from,
                to,
            }),
            cost,
        );
        Ok(())
    }

    /// Attaches a probe that sees every transition.
    pub fn insert_probe(&self, probe: Arc<dyn FsmProbe>) {
        lock(&self.inner).global_probes.add(probe);
    }

    /// Detaches a global probe; returns `false` if it was not attached.
    pub fn remove_probe(&self, probe: &Arc<dyn FsmProbe>) -> bool {
        lock(&self.inner).global_probes.remove(probe)
    }

    /// Attaches a probe that sees transitions into and out of `state`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`] when `state` is not a state.
    pub fn insert_state_probe(
        &self,
        state: usize,
        probe: Arc<dyn FsmProbe>,
    ) -> Result<(), SimError> {
        let mut machine = lock(&self.inner);
        let count = machine.state_probes.len();
        let list = machine.state_probes.get_mut(state).ok_or_else(|| {
            SimError::InvalidConfig(format!("state {state} is not one of {count} states"))
        })?;
        list.add(probe);
        Ok(())
    }

    /// Detaches a per-state probe; returns `false` if it was not attached.
    pub fn remove_state_probe(&self, state: usize, probe: &Arc<dyn FsmProbe>) -> bool {
        lock(&self.inner)
            .state_probes
            .get_mut(state)
            .is_some_and(|list| list.remove(probe))
    }
}

impl fmt::Debug for FiniteStateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FiniteStateMachine")
            .field("names", &self.names)
            .field("start", &self.start)
            .field("current", &self.current_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use rstest::rstest;

    use super::{FiniteStateMachine, MachineState, TransitionMatrix, ILLEGAL};
    use crate::clock::{Clock, MainClock};
    use crate::probe::FsmProbe;
    use crate::SimError;

    #[derive(Default)]
    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl FsmProbe for Recorder {
        fn fire_before_transition(&self, before: usize, after: usize) {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("{} before {before}->{after}", self.tag));
        }

        fn fire_after_transition(&self, before: usize, after: usize) {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("{} after {before}->{after}", self.tag));
        }
    }

    fn two_state(cost: i64) -> (MainClock, FiniteStateMachine) {
        let clock = MainClock::new(1_000_000);
        let mut matrix = TransitionMatrix::illegal(2);
        matrix.set(0, 1, cost);
        let machine = FiniteStateMachine::new(Arc::new(clock.clone()), 0, ["off", "on"], matrix)
            .expect("valid machine");
        (clock, machine)
    }

    #[test]
    fn delayed_transition_completes_when_the_clock_reaches_it() {
        let (clock, machine) = two_state(10);
        let log = Arc::new(Mutex::new(Vec::new()));
        machine.insert_probe(Arc::new(Recorder {
            tag: "global",
            log: Arc::clone(&log),
        }));

        machine.transition(1).expect("legal transition");
        assert_eq!(
            machine.current_state(),
            MachineState::InTransition { from: 0, to: 1 }
        );
        assert_eq!(machine.current_state_name(), None);

        clock.advance(9);
        assert!(machine.current_state().is_in_transition());
        clock.advance(1);
        assert_eq!(machine.current_state(), MachineState::At(1));
        assert_eq!(machine.current_state_name(), Some("on"));

        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["global before 0->1", "global after 0->1"]
        );
    }

    #[test]
    fn zero_cost_transition_is_immediate() {
        let (clock, machine) = two_state(0);
        machine.transition(1).expect("legal transition");
        assert_eq!(machine.current_state(), MachineState::At(1));
        assert_eq!(clock.pending_events(), 0);
    }

    #[test]
    fn transition_while_in_flight_is_rejected() {
        let (_clock, machine) = two_state(5);
        machine.transition(1).expect("legal transition");
        assert_eq!(
            machine.transition(0),
            Err(SimError::TransitionInProgress {
                from: 0,
                to: 1,
                requested: 0
            })
        );
    }

    /// Requests another move from inside its before-transition callback.
    #[derive(Default)]
    struct Nested {
        machine: Mutex<Option<FiniteStateMachine>>,
        outcome: Mutex<Option<Result<(), SimError>>>,
    }

    impl FsmProbe for Nested {
        fn fire_before_transition(&self, _before: usize, _after: usize) {
            let machine = self.machine.lock().expect("machine slot").take();
            if let Some(machine) = machine {
                *self.outcome.lock().expect("outcome slot") = Some(machine.transition(2));
            }
        }
    }

    #[rstest]
    #[case::immediate(0)]
    #[case::timed(10)]
    fn transition_requested_from_a_before_callback_is_refused(#[case] cost: i64) {
        let clock = MainClock::new(1_000_000);
        let machine = FiniteStateMachine::new(
            Arc::new(clock.clone()),
            0,
            ["idle", "rx", "tx"],
            TransitionMatrix::uniform(3, cost),
        )
        .expect("valid machine");
        let nested = Arc::new(Nested::default());
        *nested.machine.lock().expect("machine slot") = Some(machine.clone());
        machine.insert_probe(nested.clone());

        machine.transition(1).expect("legal transition");
        assert_eq!(
            nested.outcome.lock().expect("outcome slot").take(),
            Some(Err(SimError::TransitionInProgress {
                from: 0,
                to: 1,
                requested: 2
            }))
        );
        clock.advance(u64::try_from(cost).expect("non-negative"));
        assert_eq!(machine.current_state(), MachineState::At(1));
        assert_eq!(clock.pending_events(), 0);
    }

    #[rstest]
    #[case::negative_cost(0)]
    #[case::unknown_state(7)]
    fn forbidden_transitions_fire_nothing(#[case] target: usize) {
        let (_clock, machine) = two_state(3);
        let log = Arc::new(Mutex::new(Vec::new()));
        machine.insert_probe(Arc::new(Recorder {
            tag: "global",
            log: Arc::clone(&log),
        }));

        assert_eq!(
            machine.transition(target),
            Err(SimError::IllegalTransition {
                from: 0,
                to: target
            })
        );
        assert!(log.lock().expect("log lock").is_empty());
        assert_eq!(machine.current_state(), MachineState::At(0));
    }

    #[test]
    fn probes_fire_old_state_then_new_state_then_global() {
        let (_clock, machine) = two_state(0);
        let log = Arc::new(Mutex::new(Vec::new()));
        for (tag, state) in [("global", None), ("new", Some(1)), ("old", Some(0))] {
            let probe = Arc::new(Recorder {
                tag,
                log: Arc::clone(&log),
            });
            match state {
                Some(state) => machine
                    .insert_state_probe(state, probe)
                    .expect("known state"),
                None => machine.insert_probe(probe),
            }
        }

        machine.transition(1).expect("legal transition");
        assert_eq!(
            *log.lock().expect("log lock"),
            vec![
                "old before 0->1",
                "new before 0->1",
                "global before 0->1",
                "old after 0->1",
                "new after 0->1",
                "global after 0->1",
            ]
        );
    }

    #[test]
    fn removed_probe_is_silent_and_double_removal_is_a_no_op() {
        let (_clock, machine) = two_state(0);
        let log = Arc::new(Mutex::new(Vec::new()));
        let probe: Arc<dyn FsmProbe> = Arc::new(Recorder {
            tag: "state",
            log: Arc::clone(&log),
        });
        machine
            .insert_state_probe(1, Arc::clone(&probe))
            .expect("known state");
        assert!(machine.remove_state_probe(1, &probe));
        assert!(!machine.remove_state_probe(1, &probe));
        assert!(!machine.remove_probe(&probe));

        machine.transition(1).expect("legal transition");
        assert!(log.lock().expect("log lock").is_empty());
    }

    #[test]
    fn constructor_rejects_mismatched_names_and_start() {
        let clock: Arc<dyn Clock> = Arc::new(MainClock::new(1));
        assert!(matches!(
            FiniteStateMachine::new(Arc::clone(&clock), 0, ["a"], TransitionMatrix::uniform(2, 0)),
            Err(SimError::InvalidConfig(_))
        ));
        assert!(matches!(
            FiniteStateMachine::new(clock, 2, ["a", "b"], TransitionMatrix::uniform(2, 0)),
            Err(SimError::InvalidConfig(_))
        ));
    }

    #[test]
    fn sparse_matrix_shares_rows_until_written() {
        let mut matrix = TransitionMatrix::sparse(3, 4);
        assert!(matrix.shares_rows(0, 2));
        assert_eq!(matrix, TransitionMatrix::uniform(3, 4));

        assert!(matrix.set(1, 2, 9));
        assert_eq!(matrix.get(1, 2), Some(9));
        assert_eq!(matrix.get(0, 2), Some(4));
        assert!(!matrix.shares_rows(0, 1));
        assert!(!matrix.set(3, 0, 1));
    }

    #[test]
    fn bimodal_matrix_only_connects_through_the_hub() {
        let matrix = TransitionMatrix::bimodal(3, 0, &[0, 5, 6], &[0, 7, 8]);
        assert_eq!(matrix.get(1, 0), Some(5));
        assert_eq!(matrix.get(0, 2), Some(8));
        assert_eq!(matrix.get(1, 2), Some(ILLEGAL));
        assert_eq!(matrix.get(0, 0), Some(0));
    }

    #[test]
    fn ring_matrix_charges_the_entered_state() {
        let matrix = TransitionMatrix::ring(&[2, 0, 1], &[10, 11, 12]).set_diagonal(0);
        assert_eq!(matrix.get(2, 0), Some(10));
        assert_eq!(matrix.get(0, 1), Some(11));
        assert_eq!(matrix.get(1, 2), Some(12));
        assert_eq!(matrix.get(0, 2), Some(ILLEGAL));
        assert_eq!(matrix.get(1, 1), Some(0));
    }

    #[test]
    fn dropped_machine_leaves_a_harmless_event() {
        let (clock, machine) = two_state(4);
        machine.transition(1).expect("legal transition");
        drop(machine);
        clock.advance(10);
        assert_eq!(clock.count(), 10);
    }
}
