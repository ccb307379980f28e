//! Per-node façade and the thread-safe handle used to reach a running node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::debug;

use crate::clock::{Clock, MainClock};
use crate::execute::Interpreter;
use crate::interrupts::InterruptTable;
use crate::probe::{Probe, Watch};
use crate::{
    Event, Program, RunOutcome, RunState, SimConfig, SimError, State, StateSnapshot, StepOutcome,
    VolatileBehavior,
};

/// Work queued on a handle and applied by the interpreter at the next boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Request {
    Post(u8),
    Unpost(u8),
    Force(u8),
    Delay(u64),
}

struct HandleInner {
    id: u32,
    num_interrupts: u8,
    stop: AtomicBool,
    has_requests: AtomicBool,
    requests: Mutex<Vec<Request>>,
}

/// Cloneable, `Send + Sync` reference to one node.
///
/// Devices, clock events and other threads use it to post interrupts, add pipeline
/// delay or stop the run loop. Requests are applied in order at the next instruction
/// boundary.
#[derive(Clone)]
pub struct SimHandle {
    inner: Arc<HandleInner>,
}

impl SimHandle {
    pub(crate) fn new(id: u32, num_interrupts: u8) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id,
                num_interrupts,
                stop: AtomicBool::new(false),
                has_requests: AtomicBool::new(false),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Node identifier.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.inner.id
    }

    /// Asks the run loop to return at the next boundary.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
    }

    /// Returns `true` while a stop request is waiting to be observed.
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.inner.stop.load(Ordering::Acquire)
    }

    pub(crate) fn take_stop(&self) -> bool {
        self.inner.stop.swap(false, Ordering::AcqRel)
    }

    fn check(&self, inum: u8) -> Result<(), SimError> {
        if inum == 0 || inum >= self.inner.num_interrupts {
            return Err(SimError::InterruptOutOfRange {
                inum,
                count: self.inner.num_interrupts,
            });
        }
        Ok(())
    }

    fn push(&self, request: Request) {
        self.inner
            .requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        self.inner.has_requests.store(true, Ordering::Release);
    }

    /// Posts `inum` at the next boundary.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn post_interrupt(&self, inum: u8) -> Result<(), SimError> {
        self.check(inum)?;
        self.push(Request::Post(inum));
        Ok(())
    }

    /// Unposts `inum` at the next boundary.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn unpost_interrupt(&self, inum: u8) -> Result<(), SimError> {
        self.check(inum)?;
        self.push(Request::Unpost(inum));
        Ok(())
    }

    /// Forces `inum` at the next boundary.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn force_interrupt(&self, inum: u8) -> Result<(), SimError> {
        self.check(inum)?;
        self.push(Request::Force(inum));
        Ok(())
    }

    /// Adds pipeline delay before the next instruction.
    pub fn delay(&self, cycles: u64) {
        if cycles > 0 {
            self.push(Request::Delay(cycles));
        }
    }

    pub(crate) fn drain(&self) -> Vec<Request> {
        if !self.inner.has_requests.swap(false, Ordering::AcqRel) {
            return Vec::new();
        }
        std::mem::take(
            &mut *self
                .inner
                .requests
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

impl std::fmt::Debug for SimHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHandle")
            .field("id", &self.inner.id)
            .field("stop", &self.is_stop_requested())
            .finish_non_exhaustive()
    }
}

/// One simulated node: an interpreter plus the registration surface for probes,
/// watches, events and devices.
#[derive(Debug)]
pub struct Simulator {
    id: u32,
    interpreter: Interpreter,
}

impl Simulator {
    /// Builds a node in its reset state.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`] when `config` fails validation.
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        let id = config.node_id;
        let handle = SimHandle::new(id, config.num_interrupts);
        let interpreter = Interpreter::new(config, handle)?;
        debug!("node {id} created");
        Ok(Self { id, interpreter })
    }

    /// Node identifier.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Handle for devices and other threads.
    #[must_use]
    pub fn handle(&self) -> SimHandle {
        self.interpreter.handle().clone()
    }

    /// Loads a program image and resets `pc` to the boot address.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::ProgramTooLarge`] when the image does not fit into flash.
    pub fn load(&mut self, program: &Program) -> Result<(), SimError> {
        self.interpreter.load(program)
    }

    /// Runs until `BREAK`, a stop request or a fault.
    ///
    /// # Errors
    ///
    /// Returns the error that faulted the node.
    pub fn start(&mut self) -> Result<RunOutcome, SimError> {
        self.interpreter.run()
    }

    /// Runs a single boundary.
    ///
    /// # Errors
    ///
    /// Returns the error that faulted the node.
    pub fn step(&mut self) -> Result<StepOutcome, SimError> {
        self.interpreter.step()
    }

    /// Requests the run loop to stop at the next boundary.
    pub fn stop(&self) {
        self.interpreter.handle().stop();
    }

    /// Coarse run-loop state.
    #[must_use]
    pub const fn run_state(&self) -> RunState {
        self.interpreter.run_state()
    }

    /// Read-only view of the node.
    #[must_use]
    pub fn state(&self) -> &dyn State {
        self.interpreter.state()
    }

    /// Copy of the register-level state.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        self.interpreter.snapshot()
    }

    /// Underlying interpreter.
    #[must_use]
    pub const fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    /// Underlying interpreter, mutable.
    pub const fn interpreter_mut(&mut self) -> &mut Interpreter {
        &mut self.interpreter
    }

    /// Main clock of the node.
    #[must_use]
    pub const fn clock(&self) -> &MainClock {
        self.interpreter.clock()
    }

    /// Attaches a probe fired around every instruction.
    pub fn insert_probe(&mut self, probe: Arc<dyn Probe>) {
        self.interpreter.insert_probe(probe);
    }

    /// Detaches a global probe.
    pub fn remove_probe(&mut self, probe: &Arc<dyn Probe>) -> bool {
        self.interpreter.remove_probe(probe)
    }

    /// Attaches a probe to the instruction at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::AddressOutOfBounds`] when `addr` is outside flash.
    pub fn insert_probe_at(&mut self, addr: u32, probe: Arc<dyn Probe>) -> Result<(), SimError> {
        self.interpreter.insert_probe_at(addr, probe)
    }

    /// Detaches a probe from `addr`.
    pub fn remove_probe_at(&mut self, addr: u32, probe: &Arc<dyn Probe>) -> bool {
        self.interpreter.remove_probe_at(addr, probe)
    }

    /// Watches one data-space address.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::AddressOutOfBounds`] past the data space.
    pub fn insert_watch(&mut self, addr: u32, watch: Arc<dyn Watch>) -> Result<(), SimError> {
        self.interpreter.data_mut().insert_watch(addr, watch)
    }

    /// Stops watching `addr` with `watch`.
    pub fn remove_watch(&mut self, addr: u32, watch: &Arc<dyn Watch>) -> bool {
        self.interpreter.data_mut().remove_watch(addr, watch)
    }

    /// Watches out-of-range data accesses.
    pub fn insert_error_watch(&mut self, watch: Arc<dyn Watch>) {
        self.interpreter.data_mut().insert_error_watch(watch);
    }

    /// Removes an error watch.
    pub fn remove_error_watch(&mut self, watch: &Arc<dyn Watch>) -> bool {
        self.interpreter.data_mut().remove_error_watch(watch)
    }

    /// Schedules `event` on the main clock `cycles` from now.
    pub fn insert_event(&self, event: Arc<dyn Event>, cycles: u64) {
        self.interpreter.clock().insert_event(event, cycles);
    }

    /// Cancels a scheduled event.
    pub fn remove_event(&self, event: &Arc<dyn Event>) -> bool {
        self.interpreter.clock().remove_event(event)
    }

    /// Interrupt table.
    #[must_use]
    pub const fn interrupts(&self) -> &InterruptTable {
        self.interpreter.interrupts()
    }

    /// Interrupt table, mutable.
    pub const fn interrupts_mut(&mut self) -> &mut InterruptTable {
        self.interpreter.interrupts_mut()
    }

    /// Posts `inum` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn post_interrupt(&mut self, inum: u8) -> Result<(), SimError> {
        self.interpreter.post_interrupt(inum)
    }

    /// Forces `inum` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn force_interrupt(&mut self, inum: u8) -> Result<(), SimError> {
        self.interpreter.force_interrupt(inum)
    }

    /// Adds pipeline delay before the next instruction.
    pub const fn delay(&mut self, cycles: u64) {
        self.interpreter.delay(cycles);
    }

    /// Attaches a device model to an I/O address.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::NotVolatile`] outside the I/O region.
    pub fn install_volatile_behavior(
        &mut self,
        addr: u32,
        behavior: Box<dyn VolatileBehavior>,
    ) -> Result<(), SimError> {
        self.interpreter.install_volatile_behavior(addr, behavior)
    }
}
