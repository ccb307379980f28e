//! Interpreter for one node: register file, data space and the instruction loop.
//!
//! Every instruction boundary runs the same sequence:
//! 1. Apply requests queued on the node's [`SimHandle`]
//! 2. Burn pending pipeline delay
//! 3. Deliver the lowest pending interrupt when `I` is set (skipped once after `RETI`)
//! 4. While sleeping, skip the clock ahead to its next event
//! 5. Otherwise fetch, execute and commit one instruction, with probes around it
//!
//! Commit moves `pc` to `next_pc` and then advances the clock, so events scheduled by
//! an instruction fire after it is fully retired.

#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::similar_names
)]

pub mod alu;

use std::fmt;
use std::sync::Arc;

use log::{debug, trace, warn};

use crate::clock::{Clock, MainClock};
use crate::instr::Instr;
use crate::interrupts::InterruptTable;
use crate::memory::code::Fetched;
use crate::memory::{CodeSegment, DataLayout, Segment, IO_BASE};
use crate::probe::{Multicast, Probe};
use crate::sim::{Request, SimHandle};
use crate::state::{Register, RunState, StatusFlag, StatusRegister};
use crate::timing::{cost, cost_kind, CycleCostKind};
use crate::{
    Program, RunOutcome, SimConfig, SimError, State, StateSnapshot, StepOutcome, StopReason,
    VolatileBehavior,
};

/// Semantics behind one I/O address.
enum IoBehavior {
    /// Plain byte.
    Shadow,
    /// Composed from and decomposed into the discrete status flags.
    Sreg,
    /// Device model.
    Device(Box<dyn VolatileBehavior>),
}

struct IoSlot {
    behavior: IoBehavior,
    stored: u8,
}

/// Architectural state, kept apart from the interrupt table and probe lists so that
/// callbacks can borrow it as a [`State`] while those are being mutated.
struct Core {
    config: SimConfig,
    layout: DataLayout,
    data: Segment,
    io: Vec<IoSlot>,
    flash: CodeSegment,
    sreg: StatusRegister,
    pc: u32,
    next_pc: u32,
    clock: MainClock,
    sleeping: bool,
}

impl Core {
    fn reg(&self, reg: Register) -> u8 {
        self.data.bytes()[reg.index()]
    }

    fn set_reg(&mut self, reg: Register, value: u8) {
        self.data.bytes_mut()[reg.index()] = value;
    }

    fn word(&self, low: Register) -> u16 {
        u16::from_le_bytes([self.reg(low), self.reg(low.next())])
    }

    fn set_word(&mut self, low: Register, value: u16) {
        let [lo, hi] = value.to_le_bytes();
        self.set_reg(low, lo);
        self.set_reg(low.next(), hi);
    }

    /// Applies `op` to the value of `rd` and the status flags, storing the result.
    fn update(&mut self, rd: Register, op: impl FnOnce(&mut StatusRegister, u8) -> u8) {
        let value = self.reg(rd);
        let result = op(&mut self.sreg, value);
        self.set_reg(rd, result);
    }

    fn raw(&self, addr: u32) -> u8 {
        self.data.bytes()[addr as usize]
    }

    fn stack_pointer(&self) -> u16 {
        u16::from_le_bytes([
            self.raw(self.layout.spl_addr()),
            self.raw(self.layout.sph_addr()),
        ])
    }

    fn set_stack_pointer(&mut self, sp: u16) {
        let [lo, hi] = sp.to_le_bytes();
        let (spl, sph) = (self.layout.spl_addr(), self.layout.sph_addr());
        self.data.bytes_mut()[spl as usize] = lo;
        self.data.bytes_mut()[sph as usize] = hi;
    }

    fn io_slot(&mut self, addr: u32) -> Option<&mut IoSlot> {
        if addr < IO_BASE {
            return None;
        }
        self.io.get_mut((addr - IO_BASE) as usize)
    }

    /// In-range load with volatile dispatch; the result is cached into the raw byte.
    fn load(&mut self, addr: u32) -> u8 {
        let sreg = self.sreg.to_byte();
        let value = match self.io_slot(addr) {
            None
            | Some(IoSlot {
                behavior: IoBehavior::Shadow,
                ..
            }) => return self.raw(addr),
            Some(IoSlot {
                behavior: IoBehavior::Sreg,
                ..
            }) => sreg,
            Some(IoSlot {
                behavior: IoBehavior::Device(device),
                stored,
            }) => device.read(*stored),
        };
        self.data.bytes_mut()[addr as usize] = value;
        value
    }

    /// In-range store with volatile dispatch. Returns the new `I` flag when the status
    /// register was written.
    fn store(&mut self, addr: u32, value: u8) -> Option<bool> {
        let (cached, enable) = match self.io_slot(addr) {
            None
            | Some(IoSlot {
                behavior: IoBehavior::Shadow,
                ..
            }) => (value, None),
            Some(IoSlot {
                behavior: IoBehavior::Sreg,
                ..
            }) => {
                self.sreg = StatusRegister::from_byte(value);
                (value, Some(self.sreg.i))
            }
            Some(IoSlot {
                behavior: IoBehavior::Device(device),
                stored,
            }) => {
                *stored = device.write(*stored, value);
                (*stored, None)
            }
        };
        self.data.bytes_mut()[addr as usize] = cached;
        enable
    }
}

impl State for Core {
    fn pc(&self) -> u32 {
        self.pc
    }

    fn sp(&self) -> u16 {
        self.stack_pointer()
    }

    fn cycles(&self) -> u64 {
        self.clock.count()
    }

    fn register(&self, reg: Register) -> u8 {
        self.reg(reg)
    }

    fn sreg(&self) -> u8 {
        self.sreg.to_byte()
    }

    fn data_byte(&self, addr: u32) -> Option<u8> {
        if addr == self.layout.sreg_addr() {
            return Some(self.sreg.to_byte());
        }
        self.data.get(addr).ok()
    }

    fn program_byte(&self, addr: u32) -> Option<u8> {
        self.flash.segment().get(addr).ok()
    }

    fn instr(&self, addr: u32) -> Option<Instr> {
        self.flash.read_instr(addr)
    }

    fn is_sleeping(&self) -> bool {
        self.sleeping
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    Continue,
    Break,
}

#[derive(Debug, Clone, Copy)]
struct Executed {
    cycles: u64,
    effect: Effect,
}

/// Branch target `offset` words past the instruction after `pc`.
const fn relative(pc: u32, offset: i32) -> u32 {
    pc.wrapping_add(2).wrapping_add_signed(offset.wrapping_mul(2))
}

const fn bit_mask(bit: u8) -> u8 {
    1 << (bit & 7)
}

/// Executes instructions against one node's state.
pub struct Interpreter {
    core: Core,
    interrupts: InterruptTable,
    probes: Multicast<dyn Probe>,
    delay: u64,
    just_returned: bool,
    handle: SimHandle,
    run_state: RunState,
    fault: Option<SimError>,
}

impl Interpreter {
    /// Builds a node in its reset state: registers and RAM filled with `sram_fill`,
    /// flash erased, stack pointer at the top of RAM and `pc` at `boot_pc`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`] when `config` fails validation.
    pub fn new(config: SimConfig, handle: SimHandle) -> Result<Self, SimError> {
        config.validate()?;
        let layout = config.layout();
        let sreg_addr = layout.sreg_addr();
        let io = (IO_BASE..layout.sram_start())
            .map(|addr| IoSlot {
                behavior: if addr == sreg_addr {
                    IoBehavior::Sreg
                } else {
                    IoBehavior::Shadow
                },
                stored: 0,
            })
            .collect();
        let mut core = Core {
            layout,
            data: Segment::new("sram", layout.len() as usize, config.sram_fill),
            io,
            flash: CodeSegment::new("flash", config.flash_size as usize, config.flash_fill),
            sreg: StatusRegister::default(),
            pc: config.boot_pc,
            next_pc: config.boot_pc,
            clock: MainClock::new(config.clock_hz),
            sleeping: false,
            config,
        };
        core.set_stack_pointer(u16::try_from(layout.ramend()).unwrap_or(u16::MAX));
        let interrupts = InterruptTable::new(core.config.num_interrupts)?;
        Ok(Self {
            core,
            interrupts,
            probes: Multicast::new(),
            delay: 0,
            just_returned: false,
            handle,
            run_state: RunState::Idle,
            fault: None,
        })
    }

    /// Configuration the node was built from.
    #[must_use]
    pub const fn config(&self) -> &SimConfig {
        &self.core.config
    }

    /// Data-space layout.
    #[must_use]
    pub const fn layout(&self) -> DataLayout {
        self.core.layout
    }

    /// Read-only view handed to callbacks.
    #[must_use]
    pub fn state(&self) -> &dyn State {
        &self.core
    }

    /// Copy of the register-level state.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot::capture(&self.core)
    }

    /// Handle shared with devices and other threads.
    #[must_use]
    pub const fn handle(&self) -> &SimHandle {
        &self.handle
    }

    /// Main clock of the node.
    #[must_use]
    pub const fn clock(&self) -> &MainClock {
        &self.core.clock
    }

    /// Coarse run-loop state.
    #[must_use]
    pub const fn run_state(&self) -> RunState {
        match self.run_state {
            RunState::Idle | RunState::Running if self.core.sleeping => RunState::Sleeping,
            other => other,
        }
    }

    /// Replaces the flash contents and moves `pc` back to `boot_pc`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::ProgramTooLarge`] when the image does not fit.
    pub fn load(&mut self, program: &Program) -> Result<(), SimError> {
        self.core.flash.load(program)?;
        self.set_pc(self.core.config.boot_pc);
        self.fault = None;
        self.run_state = RunState::Idle;
        Ok(())
    }

    /// Address of the next instruction.
    #[must_use]
    pub const fn pc(&self) -> u32 {
        self.core.pc
    }

    /// Redirects execution.
    pub const fn set_pc(&mut self, pc: u32) {
        self.core.pc = pc;
        self.core.next_pc = pc;
    }

    /// General-purpose register value.
    #[must_use]
    pub fn register(&self, reg: Register) -> u8 {
        self.core.reg(reg)
    }

    /// Stack pointer.
    #[must_use]
    pub fn sp(&self) -> u16 {
        self.core.stack_pointer()
    }

    /// Composed status register.
    #[must_use]
    pub fn sreg(&self) -> u8 {
        self.core.sreg.to_byte()
    }

    /// One status flag.
    #[must_use]
    pub const fn flag(&self, flag: StatusFlag) -> bool {
        self.core.sreg.get(flag)
    }

    /// Sets one status flag; `I` also notifies the interrupt table.
    pub fn set_flag(&mut self, flag: StatusFlag, value: bool) {
        if flag == StatusFlag::I {
            self.set_interrupts_enabled(value);
        } else {
            self.core.sreg.set(flag, value);
        }
    }

    fn set_interrupts_enabled(&mut self, enabled: bool) {
        self.core.sreg.i = enabled;
        self.announce_global_enable(enabled);
    }

    fn announce_global_enable(&self, enabled: bool) {
        if enabled {
            self.interrupts.enable_all(&self.core);
        } else {
            self.interrupts.disable_all(&self.core);
        }
    }

    /// Returns `true` while the node sleeps.
    #[must_use]
    pub const fn is_sleeping(&self) -> bool {
        self.core.sleeping
    }

    /// Instrumented data read: watches, then volatile dispatch below `sram_start`.
    ///
    /// Addresses past the data space notify the error watches and read as `sram_fill`.
    pub fn read_data(&mut self, addr: u32) -> u8 {
        let core = &mut self.core;
        if addr as usize >= core.data.len() {
            core.data.fire_read_error(addr, &*core);
            return core.data.default_value();
        }
        let watches = core.data.watches_at(addr);
        if let Some(watches) = &watches {
            for watch in watches.iter() {
                watch.fire_before_read(&*core, addr);
            }
        }
        let value = core.load(addr);
        if let Some(watches) = &watches {
            for watch in watches.iter() {
                watch.fire_after_read(&*core, addr, value);
            }
        }
        value
    }

    /// Instrumented data write; the out-of-range counterpart of [`Self::read_data`]
    /// drops the value.
    pub fn write_data(&mut self, addr: u32, value: u8) {
        if addr as usize >= self.core.data.len() {
            self.core.data.fire_write_error(addr, value, &self.core);
            return;
        }
        let watches = self.core.data.watches_at(addr);
        if let Some(watches) = &watches {
            for watch in watches.iter() {
                watch.fire_before_write(&self.core, addr, value);
            }
        }
        if let Some(enabled) = self.core.store(addr, value) {
            self.announce_global_enable(enabled);
        }
        if let Some(watches) = &watches {
            for watch in watches.iter() {
                watch.fire_after_write(&self.core, addr, value);
            }
        }
    }

    /// Uninstrumented data read with the status register composed.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::AddressOutOfBounds`] past the data space.
    pub fn get_data(&self, addr: u32) -> Result<u8, SimError> {
        if addr == self.core.layout.sreg_addr() {
            return Ok(self.core.sreg.to_byte());
        }
        self.core.data.get(addr).map_err(|err| err.at_pc(self.core.pc))
    }

    /// Data segment, for watches and raw inspection.
    #[must_use]
    pub const fn data(&self) -> &Segment {
        &self.core.data
    }

    /// Data segment, mutable.
    pub const fn data_mut(&mut self) -> &mut Segment {
        &mut self.core.data
    }

    /// Flash.
    #[must_use]
    pub const fn flash(&self) -> &CodeSegment {
        &self.core.flash
    }

    /// Attaches a device model to an I/O address.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::NotVolatile`] outside the I/O region and
    /// [`SimError::InvalidConfig`] for SREG, SPL and SPH, which stay built in.
    pub fn install_volatile_behavior(
        &mut self,
        addr: u32,
        behavior: Box<dyn VolatileBehavior>,
    ) -> Result<(), SimError> {
        let layout = self.core.layout;
        let reserved = [
            ("SREG", layout.sreg_addr()),
            ("SPL", layout.spl_addr()),
            ("SPH", layout.sph_addr()),
        ];
        if let Some((name, _)) = reserved.iter().find(|(_, reserved)| *reserved == addr) {
            return Err(SimError::InvalidConfig(format!(
                "{name} at {addr:#06x} cannot be replaced"
            )));
        }
        let initial = self.core.data.get(addr).unwrap_or_default();
        let slot = self
            .core
            .io_slot(addr)
            .ok_or(SimError::NotVolatile { addr })?;
        slot.behavior = IoBehavior::Device(behavior);
        slot.stored = initial;
        Ok(())
    }

    /// Interrupt table.
    #[must_use]
    pub const fn interrupts(&self) -> &InterruptTable {
        &self.interrupts
    }

    /// Interrupt table, mutable, for probe and notification registration.
    pub const fn interrupts_mut(&mut self) -> &mut InterruptTable {
        &mut self.interrupts
    }

    /// Posts `inum` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn post_interrupt(&mut self, inum: u8) -> Result<(), SimError> {
        self.interrupts.post(inum, &self.core)
    }

    /// Unposts `inum` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn unpost_interrupt(&mut self, inum: u8) -> Result<(), SimError> {
        self.interrupts.unpost(inum, &self.core)
    }

    /// Forces `inum` immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn force_interrupt(&mut self, inum: u8) -> Result<(), SimError> {
        self.interrupts.force(inum, &self.core)
    }

    /// Unmasks `inum`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn enable_interrupt(&mut self, inum: u8) -> Result<(), SimError> {
        self.interrupts.enable(inum, &self.core)
    }

    /// Masks `inum`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn disable_interrupt(&mut self, inum: u8) -> Result<(), SimError> {
        self.interrupts.disable(inum, &self.core)
    }

    /// Attaches a probe fired around every instruction.
    pub fn insert_probe(&mut self, probe: Arc<dyn Probe>) {
        self.probes.add(probe);
    }

    /// Detaches a global probe; returns `false` if it was not attached.
    pub fn remove_probe(&mut self, probe: &Arc<dyn Probe>) -> bool {
        self.probes.remove(probe)
    }

    /// Attaches a probe to the instruction at `addr` only.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::AddressOutOfBounds`] when `addr` is outside flash.
    pub fn insert_probe_at(&mut self, addr: u32, probe: Arc<dyn Probe>) -> Result<(), SimError> {
        self.core.flash.insert_probe(addr, probe)
    }

    /// Detaches a probe from `addr`; returns `false` if it was not attached there.
    pub fn remove_probe_at(&mut self, addr: u32, probe: &Arc<dyn Probe>) -> bool {
        self.core.flash.remove_probe(addr, probe)
    }

    /// Queues `cycles` of pipeline delay, consumed at the next boundary.
    pub const fn delay(&mut self, cycles: u64) {
        self.delay = self.delay.saturating_add(cycles);
    }

    /// Runs one boundary: an interrupt entry, a sleep skip, a delay or one instruction.
    ///
    /// # Errors
    ///
    /// Returns the fetch error that faulted the node; a faulted node keeps returning it
    /// until a new program is loaded.
    pub fn step(&mut self) -> Result<StepOutcome, SimError> {
        if self.run_state == RunState::Stopped {
            self.run_state = RunState::Idle;
        }
        let outcome = self.checked_boundary()?;
        if matches!(outcome, StepOutcome::Break { .. } | StepOutcome::Stopped) {
            self.run_state = RunState::Stopped;
        }
        Ok(outcome)
    }

    /// Runs until a stop request, `BREAK` or a fault.
    ///
    /// # Errors
    ///
    /// Returns the error that faulted the node.
    pub fn run(&mut self) -> Result<RunOutcome, SimError> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        self.run_state = RunState::Running;
        let id = self.handle.id();
        debug!("node {id} running from pc {:#06x}", self.core.pc);

        let mut instructions = 0;
        let mut interrupts = 0;
        let reason = loop {
            match self.checked_boundary()? {
                StepOutcome::Retired { .. } => instructions += 1,
                StepOutcome::Interrupted { .. } => interrupts += 1,
                StepOutcome::Slept { .. } | StepOutcome::Delayed { .. } => {}
                StepOutcome::Break { .. } => {
                    instructions += 1;
                    break StopReason::Break;
                }
                StepOutcome::Stopped => break StopReason::Requested,
            }
        };

        self.run_state = RunState::Stopped;
        let cycles = self.core.clock.count();
        debug!("node {id} stopped ({reason:?}) after {instructions} instructions, {cycles} cycles");
        Ok(RunOutcome {
            instructions,
            interrupts,
            cycles,
            reason,
        })
    }

    fn checked_boundary(&mut self) -> Result<StepOutcome, SimError> {
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        match self.boundary() {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                warn!("node {} faulted: {err}", self.handle.id());
                self.run_state = RunState::Faulted(err.class());
                self.fault = Some(err.clone());
                Err(err)
            }
        }
    }

    fn boundary(&mut self) -> Result<StepOutcome, SimError> {
        if self.handle.take_stop() {
            return Ok(StepOutcome::Stopped);
        }
        self.apply_requests();

        if self.delay > 0 {
            let cycles = std::mem::take(&mut self.delay);
            self.core.clock.advance(cycles);
            return Ok(StepOutcome::Delayed { cycles });
        }

        if !self.just_returned && self.core.sreg.i {
            if let Some(inum) = self.interrupts.lowest_pending() {
                self.invoke_interrupt(inum);
                return Ok(StepOutcome::Interrupted { inum });
            }
        }

        if self.core.sleeping {
            let cycles = self.core.clock.skip_ahead();
            return Ok(StepOutcome::Slept { cycles });
        }

        self.fetch_execute_commit()
    }

    fn apply_requests(&mut self) {
        for request in self.handle.drain() {
            let result = match request {
                Request::Post(inum) => self.interrupts.post(inum, &self.core),
                Request::Unpost(inum) => self.interrupts.unpost(inum, &self.core),
                Request::Force(inum) => self.interrupts.force(inum, &self.core),
                Request::Delay(cycles) => {
                    self.delay(cycles);
                    Ok(())
                }
            };
            if let Err(err) = result {
                warn!("node {}: dropped request: {err}", self.handle.id());
            }
        }
    }

    fn invoke_interrupt(&mut self, inum: u8) {
        let vector = self.core.config.vector_address(inum);
        trace!(
            "node {}: interrupt {inum} at pc {:#06x} -> vector {vector:#06x}",
            self.handle.id(),
            self.core.pc
        );
        self.interrupts.before_invoke(inum, &self.core);
        self.push_pc(self.core.pc);
        self.core.sreg.i = false;
        self.set_pc(vector);
        self.core.sleeping = false;
        self.core
            .clock
            .advance(cost(CycleCostKind::InterruptEntry));
        self.interrupts.after_invoke(inum, &self.core);
    }

    fn fetch_execute_commit(&mut self) -> Result<StepOutcome, SimError> {
        let pc = self.core.pc;
        let (instr, local) = match self.core.flash.fetch(pc)? {
            Fetched::Plain(instr) => (Some(instr), None),
            Fetched::Probed { instr, probes } => (instr, Some(probes)),
        };
        let global = (!self.probes.is_empty()).then(|| self.probes.snapshot());

        for probe in global.iter().chain(local.iter()).flat_map(|list| list.iter()) {
            probe.fire_before(&self.core, pc);
        }

        let instr = instr.ok_or(SimError::NoSuchInstruction { pc })?;
        self.just_returned = false;
        self.core.next_pc = pc + instr.size();
        let executed = self.execute(pc, instr);

        self.core.pc = self.core.next_pc;
        self.core.clock.advance(executed.cycles);

        for probe in local.iter().chain(global.iter()).flat_map(|list| list.iter()) {
            probe.fire_after(&self.core, pc);
        }

        Ok(match executed.effect {
            Effect::Continue => StepOutcome::Retired {
                pc,
                cycles: executed.cycles,
            },
            Effect::Break => StepOutcome::Break { pc },
        })
    }

    fn push(&mut self, value: u8) {
        let sp = self.core.stack_pointer();
        self.write_data(u32::from(sp), value);
        self.core.set_stack_pointer(sp.wrapping_sub(1));
    }

    fn pop(&mut self) -> u8 {
        let sp = self.core.stack_pointer().wrapping_add(1);
        self.core.set_stack_pointer(sp);
        self.read_data(u32::from(sp))
    }

    /// Pushes a return address as a word address, low byte first.
    fn push_pc(&mut self, addr: u32) {
        let [lo, hi, ..] = (addr / 2).to_le_bytes();
        self.push(lo);
        self.push(hi);
    }

    fn pop_pc(&mut self) -> u32 {
        let hi = self.pop();
        let lo = self.pop();
        u32::from(u16::from_le_bytes([lo, hi])) * 2
    }

    #[allow(clippy::too_many_lines)]
    fn execute(&mut self, pc: u32, instr: Instr) -> Executed {
        let mut cycles = cost(cost_kind(instr));
        let mut effect = Effect::Continue;
        let carry = self.core.sreg.c;

        match instr {
            Instr::Nop | Instr::Wdr => {}
            Instr::Mov { rd, rr } => {
                let value = self.core.reg(rr);
                self.core.set_reg(rd, value);
            }
            Instr::Movw { rd, rr } => {
                let value = self.core.word(rr);
                self.core.set_word(rd, value);
            }
            Instr::Ldi { rd, k } => self.core.set_reg(rd, k),
            Instr::Add { rd, rr } => {
                let b = self.core.reg(rr);
                self.core.update(rd, |sreg, a| alu::add(sreg, a, b, false));
            }
            Instr::Adc { rd, rr } => {
                let b = self.core.reg(rr);
                self.core.update(rd, |sreg, a| alu::add(sreg, a, b, carry));
            }
            Instr::Sub { rd, rr } => {
                let b = self.core.reg(rr);
                self.core
                    .update(rd, |sreg, a| alu::sub(sreg, a, b, false, false));
            }
            Instr::Sbc { rd, rr } => {
                let b = self.core.reg(rr);
                self.core
                    .update(rd, |sreg, a| alu::sub(sreg, a, b, carry, true));
            }
            Instr::Subi { rd, k } => {
                self.core
                    .update(rd, |sreg, a| alu::sub(sreg, a, k, false, false));
            }
            Instr::And { rd, rr } => {
                let b = self.core.reg(rr);
                self.core.update(rd, |sreg, a| alu::logic(sreg, a & b));
            }
            Instr::Or { rd, rr } => {
                let b = self.core.reg(rr);
                self.core.update(rd, |sreg, a| alu::logic(sreg, a | b));
            }
            Instr::Eor { rd, rr } => {
                let b = self.core.reg(rr);
                self.core.update(rd, |sreg, a| alu::logic(sreg, a ^ b));
            }
            Instr::Andi { rd, k } => self.core.update(rd, |sreg, a| alu::logic(sreg, a & k)),
            Instr::Ori { rd, k } => self.core.update(rd, |sreg, a| alu::logic(sreg, a | k)),
            Instr::Cp { rd, rr } => {
                let (a, b) = (self.core.reg(rd), self.core.reg(rr));
                alu::sub(&mut self.core.sreg, a, b, false, false);
            }
            Instr::Cpc { rd, rr } => {
                let (a, b) = (self.core.reg(rd), self.core.reg(rr));
                alu::sub(&mut self.core.sreg, a, b, carry, true);
            }
            Instr::Cpi { rd, k } => {
                let a = self.core.reg(rd);
                alu::sub(&mut self.core.sreg, a, k, false, false);
            }
            Instr::Com { rd } => self.core.update(rd, alu::com),
            Instr::Inc { rd } => self.core.update(rd, alu::inc),
            Instr::Dec { rd } => self.core.update(rd, alu::dec),
            Instr::Lsr { rd } => self.core.update(rd, alu::lsr),
            Instr::Adiw { rd, k } => {
                let word = self.core.word(rd);
                let result = alu::adiw(&mut self.core.sreg, word, k);
                self.core.set_word(rd, result);
            }
            Instr::Sbiw { rd, k } => {
                let word = self.core.word(rd);
                let result = alu::sbiw(&mut self.core.sreg, word, k);
                self.core.set_word(rd, result);
            }
            Instr::Brbs { flag, offset } | Instr::Brbc { flag, offset } => {
                let wanted = matches!(instr, Instr::Brbs { .. });
                if self.core.sreg.get(flag) == wanted {
                    self.core.next_pc = relative(pc, i32::from(offset));
                    cycles = cost(CycleCostKind::BranchTaken);
                }
            }
            Instr::Rjmp { offset } => self.core.next_pc = relative(pc, i32::from(offset)),
            Instr::Jmp { target } => self.core.next_pc = target.wrapping_mul(2),
            Instr::Ijmp => self.core.next_pc = u32::from(self.core.word(Register::Z)) * 2,
            Instr::Rcall { offset } => {
                self.push_pc(pc + 2);
                self.core.next_pc = relative(pc, i32::from(offset));
            }
            Instr::Call { target } => {
                self.push_pc(pc + 4);
                self.core.next_pc = target.wrapping_mul(2);
            }
            Instr::Ret => self.core.next_pc = self.pop_pc(),
            Instr::Reti => {
                self.core.next_pc = self.pop_pc();
                self.set_interrupts_enabled(true);
                self.just_returned = true;
            }
            Instr::Lds { rd, addr } => {
                let value = self.read_data(u32::from(addr));
                self.core.set_reg(rd, value);
            }
            Instr::Sts { addr, rr } => {
                let value = self.core.reg(rr);
                self.write_data(u32::from(addr), value);
            }
            Instr::Ld { rd, ptr } => {
                let addr = self.core.word(ptr.low());
                let value = self.read_data(u32::from(addr));
                self.core.set_reg(rd, value);
            }
            Instr::St { ptr, rr } => {
                let addr = self.core.word(ptr.low());
                let value = self.core.reg(rr);
                self.write_data(u32::from(addr), value);
            }
            Instr::Lpm { rd } => {
                let addr = u32::from(self.core.word(Register::Z));
                let value = self.core.flash.segment().read(addr, &self.core);
                self.core.set_reg(rd, value);
            }
            Instr::In { rd, io } => {
                let value = self.read_data(DataLayout::io_to_data(u32::from(io)));
                self.core.set_reg(rd, value);
            }
            Instr::Out { io, rr } => {
                let value = self.core.reg(rr);
                self.write_data(DataLayout::io_to_data(u32::from(io)), value);
            }
            Instr::Sbi { io, bit } | Instr::Cbi { io, bit } => {
                let addr = DataLayout::io_to_data(u32::from(io));
                let value = self.read_data(addr);
                let value = if matches!(instr, Instr::Sbi { .. }) {
                    value | bit_mask(bit)
                } else {
                    value & !bit_mask(bit)
                };
                self.write_data(addr, value);
            }
            Instr::Sbic { io, bit } | Instr::Sbis { io, bit } => {
                let value = self.read_data(DataLayout::io_to_data(u32::from(io)));
                let set = value & bit_mask(bit) != 0;
                if set == matches!(instr, Instr::Sbis { .. }) {
                    let next = pc + 2;
                    let size = self.core.flash.read_instr(next).map_or(2, Instr::size);
                    self.core.next_pc = next + size;
                    cycles += cost(CycleCostKind::SkipWord) * u64::from(size / 2);
                }
            }
            Instr::Push { rr } => {
                let value = self.core.reg(rr);
                self.push(value);
            }
            Instr::Pop { rd } => {
                let value = self.pop();
                self.core.set_reg(rd, value);
            }
            Instr::Bset { flag } => self.set_flag(flag, true),
            Instr::Bclr { flag } => self.set_flag(flag, false),
            Instr::Sleep => {
                trace!("node {}: sleeping at pc {pc:#06x}", self.handle.id());
                self.core.sleeping = true;
            }
            Instr::Break => effect = Effect::Break,
        }

        Executed { cycles, effect }
    }
}

impl fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interpreter")
            .field("node", &self.handle.id())
            .field("pc", &format_args!("{:#06x}", self.core.pc))
            .field("sp", &format_args!("{:#06x}", self.core.stack_pointer()))
            .field("sreg", &format_args!("{}", self.core.sreg))
            .field("cycles", &self.core.clock.count())
            .field("run_state", &self.run_state())
            .field("interrupts", &self.interrupts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::Interpreter;
    use crate::instr::{Instr, PointerRegister};
    use crate::interrupts::AutoClear;
    use crate::probe::{InterruptProbe, Watch};
    use crate::sim::SimHandle;
    use crate::state::{Register, StatusFlag};
    use crate::{
        Clock, DataLayout, Program, RunState, SimConfig, SimError, State, StepOutcome,
        StopReason, VolatileBehavior,
    };

    fn config() -> SimConfig {
        SimConfig {
            flash_size: 1024,
            sram_size: 256,
            num_interrupts: 8,
            ..SimConfig::default()
        }
    }

    fn interpreter_with(config: SimConfig, program: &Program) -> Interpreter {
        let handle = SimHandle::new(config.node_id, config.num_interrupts);
        let mut interpreter = Interpreter::new(config, handle).expect("valid config");
        interpreter.load(program).expect("program fits");
        interpreter
    }

    fn interpreter(instrs: &[Instr]) -> Interpreter {
        interpreter_with(config(), &Program::from_instrs(instrs))
    }

    #[test]
    fn counting_loop_retires_with_exact_cycles() {
        let mut interpreter = interpreter(&[
            Instr::Ldi {
                rd: Register::R16,
                k: 3,
            },
            Instr::Ldi {
                rd: Register::R17,
                k: 0,
            },
            Instr::Inc { rd: Register::R17 },
            Instr::Dec { rd: Register::R16 },
            Instr::brne(-3),
            Instr::Break,
        ]);

        let outcome = interpreter.run().expect("program runs");
        assert_eq!(outcome.reason, StopReason::Break);
        assert_eq!(outcome.instructions, 12);
        assert_eq!(outcome.cycles, 14);
        assert_eq!(interpreter.register(Register::R17), 3);
        assert_eq!(interpreter.register(Register::R16), 0);
        assert!(interpreter.flag(StatusFlag::Z));
        assert_eq!(interpreter.run_state(), RunState::Stopped);
    }

    #[test]
    fn call_pushes_word_address_low_byte_first_and_ret_pops_it() {
        let mut program = Program::default();
        program.push(Instr::Call { target: 3 });
        program.push(Instr::Break);
        program.push(Instr::Ldi {
            rd: Register::R20,
            k: 0x55,
        });
        program.push(Instr::Ret);
        let mut interpreter = interpreter_with(config(), &program);
        let top = interpreter.sp();

        assert_eq!(
            interpreter.step().expect("call"),
            StepOutcome::Retired { pc: 0, cycles: 4 }
        );
        assert_eq!(interpreter.pc(), 6);
        assert_eq!(interpreter.sp(), top - 2);
        assert_eq!(interpreter.get_data(u32::from(top)), Ok(0x02));
        assert_eq!(interpreter.get_data(u32::from(top) - 1), Ok(0x00));

        let outcome = interpreter.run().expect("program runs");
        assert_eq!(outcome.reason, StopReason::Break);
        assert_eq!(interpreter.sp(), top);
        assert_eq!(interpreter.register(Register::R20), 0x55);
        assert_eq!(interpreter.clock().count(), 10);
    }

    #[test]
    fn pointer_store_and_load_go_through_data_space() {
        let mut interpreter = interpreter(&[
            Instr::Ldi {
                rd: Register::R26,
                k: 0x80,
            },
            Instr::Ldi {
                rd: Register::R27,
                k: 0x00,
            },
            Instr::Ldi {
                rd: Register::R18,
                k: 0x42,
            },
            Instr::St {
                ptr: PointerRegister::X,
                rr: Register::R18,
            },
            Instr::Lds {
                rd: Register::R19,
                addr: 0x80,
            },
            Instr::Break,
        ]);
        interpreter.run().expect("program runs");
        assert_eq!(interpreter.get_data(0x80), Ok(0x42));
        assert_eq!(interpreter.register(Register::R19), 0x42);
    }

    #[test]
    fn lpm_reads_constant_bytes_from_flash() {
        let mut program = Program::from_instrs(&[
            Instr::Ldi {
                rd: Register::R30,
                k: 0x00,
            },
            Instr::Ldi {
                rd: Register::R31,
                k: 0x01,
            },
            Instr::Lpm { rd: Register::R0 },
            Instr::Break,
        ]);
        program.insert_byte(0x100, 0xAB);
        let mut interpreter = interpreter_with(config(), &program);
        let outcome = interpreter.run().expect("program runs");
        assert_eq!(interpreter.register(Register::R0), 0xAB);
        assert_eq!(outcome.cycles, 1 + 1 + 3 + 1);
    }

    #[test]
    fn skip_over_a_two_word_instruction_costs_an_extra_cycle_per_word() {
        let mut interpreter = interpreter(&[
            Instr::Sbic { io: 0x10, bit: 0 },
            Instr::Call { target: 0 },
            Instr::Break,
        ]);
        assert_eq!(
            interpreter.step().expect("skip"),
            StepOutcome::Retired { pc: 0, cycles: 3 }
        );
        assert_eq!(interpreter.pc(), 6);
    }

    #[test]
    fn sbi_then_sbis_skips_the_next_instruction() {
        let mut interpreter = interpreter(&[
            Instr::Sbi { io: 0x10, bit: 3 },
            Instr::Sbis { io: 0x10, bit: 3 },
            Instr::Ldi {
                rd: Register::R16,
                k: 1,
            },
            Instr::Break,
        ]);
        interpreter.run().expect("program runs");
        assert_eq!(interpreter.get_data(0x30), Ok(0x08));
        assert_eq!(interpreter.register(Register::R16), 0);
    }

    struct Doubling;

    impl VolatileBehavior for Doubling {
        fn read(&mut self, current: u8) -> u8 {
            current.wrapping_mul(2)
        }
    }

    #[test]
    fn volatile_behavior_sees_stored_value_on_every_read() {
        let mut interpreter = interpreter(&[Instr::Break]);
        let addr = DataLayout::io_to_data(0x20);
        interpreter
            .install_volatile_behavior(addr, Box::new(Doubling))
            .expect("i/o address");

        interpreter.write_data(addr, 7);
        assert_eq!(interpreter.read_data(addr), 14);
        assert_eq!(interpreter.read_data(addr), 14);
    }

    #[test]
    fn volatile_behavior_outside_io_region_is_rejected() {
        let mut interpreter = interpreter(&[Instr::Break]);
        let sram_start = interpreter.layout().sram_start();
        assert_eq!(
            interpreter.install_volatile_behavior(sram_start, Box::new(Doubling)),
            Err(SimError::NotVolatile { addr: sram_start })
        );
        assert_eq!(
            interpreter.install_volatile_behavior(5, Box::new(Doubling)),
            Err(SimError::NotVolatile { addr: 5 })
        );
        let sreg = interpreter.layout().sreg_addr();
        assert!(interpreter
            .install_volatile_behavior(sreg, Box::new(Doubling))
            .is_err());
    }

    #[test]
    fn stack_pointer_bytes_reject_device_models() {
        let mut interpreter = interpreter(&[Instr::Push { rr: Register::R0 }, Instr::Break]);
        let layout = interpreter.layout();
        for addr in [layout.spl_addr(), layout.sph_addr()] {
            assert!(matches!(
                interpreter.install_volatile_behavior(addr, Box::new(Doubling)),
                Err(SimError::InvalidConfig(_))
            ));
        }

        let before = interpreter.sp();
        assert_eq!(
            interpreter.run().expect("runs").reason,
            StopReason::Break
        );
        assert_eq!(interpreter.sp(), before - 1);
    }

    #[derive(Default)]
    struct GlobalLog(Mutex<Vec<String>>);

    impl InterruptProbe for GlobalLog {
        fn fire_when_enabled(&self, _state: &dyn State, inum: u8) {
            self.0
                .lock()
                .expect("log lock")
                .push(format!("enabled {inum}"));
        }

        fn fire_when_disabled(&self, _state: &dyn State, inum: u8) {
            self.0
                .lock()
                .expect("log lock")
                .push(format!("disabled {inum}"));
        }
    }

    #[test]
    fn sreg_writes_update_flags_and_announce_global_enable() {
        let mut interpreter = interpreter(&[Instr::Break]);
        let log = Arc::new(GlobalLog::default());
        interpreter.interrupts_mut().insert_global_probe(log.clone());
        let sreg = interpreter.layout().sreg_addr();

        interpreter.write_data(sreg, 0x80);
        assert!(interpreter.flag(StatusFlag::I));
        interpreter.set_flag(StatusFlag::Z, true);
        assert_eq!(interpreter.read_data(sreg), 0x82);
        assert_eq!(interpreter.state().data_byte(sreg), Some(0x82));
        interpreter.set_flag(StatusFlag::I, false);

        assert_eq!(
            *log.0.lock().expect("log lock"),
            vec!["enabled 0", "disabled 0"]
        );
    }

    #[derive(Default)]
    struct ErrorCounter(Mutex<Vec<u32>>);

    impl Watch for ErrorCounter {
        fn fire_before_read(&self, _state: &dyn State, addr: u32) {
            self.0.lock().expect("log lock").push(addr);
        }
    }

    #[test]
    fn out_of_range_data_read_is_soft() {
        let config = SimConfig {
            sram_fill: 0x5A,
            ..config()
        };
        let mut program = Program::default();
        program.push(Instr::Lds {
            rd: Register::R1,
            addr: 0xF000,
        });
        program.push(Instr::Break);
        let mut interpreter = interpreter_with(config, &program);
        let counter = Arc::new(ErrorCounter::default());
        interpreter.data_mut().insert_error_watch(counter.clone());

        let outcome = interpreter.run().expect("soft error keeps running");
        assert_eq!(outcome.reason, StopReason::Break);
        assert_eq!(interpreter.register(Register::R1), 0x5A);
        assert_eq!(*counter.0.lock().expect("log lock"), vec![0xF000]);
    }

    fn vectored_program(boot: u32, main: &[Instr], vectors: &[(u8, Instr)]) -> (SimConfig, Program) {
        let config = SimConfig {
            boot_pc: boot,
            ..config()
        };
        let mut program = Program::new(0, 0);
        for (inum, instr) in vectors {
            program
                .insert_instr(config.vector_address(*inum), *instr)
                .expect("aligned vector");
        }
        let mut addr = boot;
        for instr in main {
            program.insert_instr(addr, *instr).expect("aligned");
            addr += instr.size();
        }
        (config, program)
    }

    #[test]
    fn reti_lets_exactly_one_instruction_run_before_the_next_interrupt() {
        let (config, program) = vectored_program(
            0x40,
            &[Instr::SEI, Instr::Nop, Instr::Nop, Instr::Break],
            &[(3, Instr::Reti)],
        );
        let mut interpreter = interpreter_with(config, &program);
        interpreter.post_interrupt(3).expect("in range");
        interpreter.enable_interrupt(3).expect("in range");

        let steps: Vec<_> = (0..5)
            .map(|_| interpreter.step().expect("step"))
            .collect();
        assert_eq!(
            steps,
            vec![
                StepOutcome::Retired { pc: 0x40, cycles: 1 },
                StepOutcome::Interrupted { inum: 3 },
                StepOutcome::Retired { pc: 0x08, cycles: 4 },
                StepOutcome::Retired { pc: 0x42, cycles: 1 },
                StepOutcome::Interrupted { inum: 3 },
            ]
        );
    }

    #[test]
    fn interrupt_entry_pushes_pc_clears_i_and_costs_four_cycles() {
        let (config, program) =
            vectored_program(0x40, &[Instr::SEI, Instr::Break], &[(2, Instr::Reti)]);
        let mut interpreter = interpreter_with(config, &program);
        interpreter
            .interrupts_mut()
            .register_notification(2, Some(Arc::new(AutoClear)))
            .expect("in range");
        interpreter.post_interrupt(2).expect("in range");
        interpreter.enable_interrupt(2).expect("in range");
        let top = interpreter.sp();

        interpreter.step().expect("sei");
        assert_eq!(
            interpreter.step().expect("entry"),
            StepOutcome::Interrupted { inum: 2 }
        );
        assert_eq!(interpreter.pc(), 4);
        assert!(!interpreter.flag(StatusFlag::I));
        assert!(!interpreter.interrupts().is_posted(2));
        assert_eq!(interpreter.sp(), top - 2);
        assert_eq!(interpreter.get_data(u32::from(top)), Ok(0x21));
        assert_eq!(interpreter.clock().count(), 5);

        let outcome = interpreter.run().expect("program runs");
        assert_eq!(outcome.reason, StopReason::Break);
        assert!(interpreter.flag(StatusFlag::I));
    }

    #[test]
    fn sleep_skips_to_the_event_that_posts_the_wakeup_interrupt() {
        let (config, program) = vectored_program(
            0x40,
            &[
                Instr::SEI,
                Instr::Sleep,
                Instr::Ldi {
                    rd: Register::R22,
                    k: 1,
                },
                Instr::Break,
            ],
            &[(2, Instr::Reti)],
        );
        let mut interpreter = interpreter_with(config, &program);
        interpreter
            .interrupts_mut()
            .register_notification(2, Some(Arc::new(AutoClear)))
            .expect("in range");
        interpreter.enable_interrupt(2).expect("in range");
        let handle = interpreter.handle().clone();
        interpreter.clock().insert_event(
            Arc::new(move || handle.post_interrupt(2).expect("in range")),
            100,
        );

        let outcome = interpreter.run().expect("program runs");
        assert_eq!(outcome.reason, StopReason::Break);
        assert_eq!(outcome.interrupts, 1);
        assert_eq!(interpreter.register(Register::R22), 1);
        assert!(!interpreter.is_sleeping());
        assert_eq!(outcome.cycles, 1 + 1 + 98 + 4 + 4 + 1 + 1);
    }

    #[test]
    fn queued_delay_is_consumed_before_the_next_instruction() {
        let mut interpreter = interpreter(&[Instr::Nop, Instr::Break]);
        interpreter.delay(5);
        assert_eq!(
            interpreter.step().expect("delay"),
            StepOutcome::Delayed { cycles: 5 }
        );
        assert_eq!(
            interpreter.step().expect("nop"),
            StepOutcome::Retired { pc: 0, cycles: 1 }
        );
        assert_eq!(interpreter.clock().count(), 6);
    }

    #[test]
    fn handle_stop_is_observed_at_the_next_boundary() {
        let mut interpreter = interpreter(&[Instr::Rjmp { offset: -1 }]);
        interpreter.handle().stop();
        let outcome = interpreter.run().expect("loop stops");
        assert_eq!(outcome.reason, StopReason::Requested);
        assert_eq!(outcome.instructions, 0);
    }

    #[test]
    fn missing_instruction_faults_the_node_until_reload() {
        let mut interpreter = interpreter(&[Instr::Nop]);
        let expected = SimError::NoSuchInstruction { pc: 2 };
        assert_eq!(interpreter.run(), Err(expected.clone()));
        assert_eq!(
            interpreter.run_state(),
            RunState::Faulted(crate::FaultClass::Instruction)
        );
        assert_eq!(interpreter.step(), Err(expected));

        interpreter
            .load(&Program::from_instrs(&[Instr::Break]))
            .expect("program fits");
        assert_eq!(
            interpreter.step().expect("break"),
            StepOutcome::Break { pc: 0 }
        );
    }

    #[test]
    fn jump_outside_flash_is_a_pc_fault() {
        let mut interpreter = interpreter(&[Instr::Jmp { target: 0x1000 }]);
        assert_eq!(
            interpreter.run(),
            Err(SimError::PcOutOfBounds {
                pc: 0x2000,
                len: 1024
            })
        );
    }
}
