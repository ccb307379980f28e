//! Posted/enabled/pending interrupt bookkeeping.
//!
//! Interrupt numbers run from 1 (the reset vector) to `num_interrupts - 1`. Number 0 is
//! never posted; it is the channel on which global enable/disable events are reported.
//! `pending` is recomputed as `posted & enabled` after every mutation, so it can be
//! read at any instruction boundary without further work.

use std::fmt;
use std::sync::Arc;

use crate::probe::{InterruptProbe, Multicast};
use crate::{SimError, State, MAX_INTERRUPTS};

/// Device-side hook attached to one interrupt number.
pub trait Notification: Send + Sync {
    /// The interrupt was forced from outside the device model.
    fn force(&self, inum: u8) {
        let _ = inum;
    }

    /// Delivery of the interrupt has started; the hook may update the table, e.g. to
    /// clear a flag that hardware clears on entry.
    fn invoke(&self, table: &mut InterruptTable, state: &dyn State, inum: u8) {
        let _ = (table, state, inum);
    }
}

/// Notification for interrupt flags that hardware clears when the vector is taken.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoClear;

impl Notification for AutoClear {
    fn invoke(&self, table: &mut InterruptTable, state: &dyn State, inum: u8) {
        let cleared = table.unpost(inum, state);
        debug_assert!(cleared.is_ok(), "delivered interrupt {inum} is in range");
    }
}

/// Interrupt masks, probes and device notifications of one node.
pub struct InterruptTable {
    num_interrupts: u8,
    posted: u64,
    enabled: u64,
    pending: u64,
    probes: Vec<Multicast<dyn InterruptProbe>>,
    global_probes: Multicast<dyn InterruptProbe>,
    notifications: Vec<Option<Arc<dyn Notification>>>,
}

impl InterruptTable {
    /// Creates a table with everything unposted and disabled.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InvalidConfig`] when `num_interrupts` is 0 or exceeds the
    /// 64-bit mask width.
    pub fn new(num_interrupts: u8) -> Result<Self, SimError> {
        if num_interrupts == 0 || num_interrupts > MAX_INTERRUPTS {
            return Err(SimError::InvalidConfig(format!(
                "num_interrupts must be within 1..={MAX_INTERRUPTS}, got {num_interrupts}"
            )));
        }
        let count = usize::from(num_interrupts);
        Ok(Self {
            num_interrupts,
            posted: 0,
            enabled: 0,
            pending: 0,
            probes: vec![Multicast::new(); count],
            global_probes: Multicast::new(),
            notifications: vec![None; count],
        })
    }

    /// Number of interrupt vectors, reset included.
    #[must_use]
    pub const fn num_interrupts(&self) -> u8 {
        self.num_interrupts
    }

    fn mask(&self, inum: u8) -> Result<u64, SimError> {
        if inum == 0 || inum >= self.num_interrupts {
            return Err(SimError::InterruptOutOfRange {
                inum,
                count: self.num_interrupts,
            });
        }
        Ok(1 << inum)
    }

    const fn recompute(&mut self) {
        self.pending = self.posted & self.enabled;
    }

    fn fire(&self, inum: u8, hook: impl Fn(&dyn InterruptProbe)) {
        for probe in self.probes[usize::from(inum)].iter() {
            hook(probe.as_ref());
        }
        for probe in self.global_probes.iter() {
            hook(probe.as_ref());
        }
    }

    /// Raises the request for `inum`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn post(&mut self, inum: u8, state: &dyn State) -> Result<(), SimError> {
        let mask = self.mask(inum)?;
        self.posted |= mask;
        self.recompute();
        self.fire(inum, |probe| probe.fire_when_posted(state, inum));
        Ok(())
    }

    /// Withdraws the request for `inum`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn unpost(&mut self, inum: u8, state: &dyn State) -> Result<(), SimError> {
        let mask = self.mask(inum)?;
        self.posted &= !mask;
        self.recompute();
        self.fire(inum, |probe| probe.fire_when_unposted(state, inum));
        Ok(())
    }

    /// Unmasks `inum`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn enable(&mut self, inum: u8, state: &dyn State) -> Result<(), SimError> {
        let mask = self.mask(inum)?;
        self.enabled |= mask;
        self.recompute();
        self.fire(inum, |probe| probe.fire_when_enabled(state, inum));
        Ok(())
    }

    /// Masks `inum`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn disable(&mut self, inum: u8, state: &dyn State) -> Result<(), SimError> {
        let mask = self.mask(inum)?;
        self.enabled &= !mask;
        self.recompute();
        self.fire(inum, |probe| probe.fire_when_disabled(state, inum));
        Ok(())
    }

    /// Posts `inum` and tells its notification that the request came from outside.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn force(&mut self, inum: u8, state: &dyn State) -> Result<(), SimError> {
        self.post(inum, state)?;
        if let Some(notification) = &self.notifications[usize::from(inum)] {
            notification.force(inum);
        }
        Ok(())
    }

    /// Reports the global interrupt enable to global probes as interrupt 0.
    pub fn enable_all(&self, state: &dyn State) {
        for probe in self.global_probes.iter() {
            probe.fire_when_enabled(state, 0);
        }
    }

    /// Reports the global interrupt disable to global probes as interrupt 0.
    pub fn disable_all(&self, state: &dyn State) {
        for probe in self.global_probes.iter() {
            probe.fire_when_disabled(state, 0);
        }
    }

    /// First step of delivery: probes, then the device notification.
    pub(crate) fn before_invoke(&mut self, inum: u8, state: &dyn State) {
        self.fire(inum, |probe| probe.fire_before_invoke(state, inum));
        if let Some(notification) = self.notifications[usize::from(inum)].clone() {
            notification.invoke(self, state, inum);
        }
    }

    /// Last step of delivery, with control already at the vector.
    pub(crate) fn after_invoke(&self, inum: u8, state: &dyn State) {
        self.fire(inum, |probe| probe.fire_after_invoke(state, inum));
    }

    /// Returns `true` when `inum` is posted.
    #[must_use]
    pub fn is_posted(&self, inum: u8) -> bool {
        self.mask(inum).is_ok_and(|mask| self.posted & mask != 0)
    }

    /// Returns `true` when `inum` is enabled.
    #[must_use]
    pub fn is_enabled(&self, inum: u8) -> bool {
        self.mask(inum).is_ok_and(|mask| self.enabled & mask != 0)
    }

    /// Returns `true` when `inum` is both posted and enabled.
    #[must_use]
    pub fn is_pending(&self, inum: u8) -> bool {
        self.mask(inum).is_ok_and(|mask| self.pending & mask != 0)
    }

    /// Posted bitmask, bit `n` for interrupt `n`.
    #[must_use]
    pub const fn posted_mask(&self) -> u64 {
        self.posted
    }

    /// Enabled bitmask.
    #[must_use]
    pub const fn enabled_mask(&self) -> u64 {
        self.enabled
    }

    /// Pending bitmask, always `posted & enabled`.
    #[must_use]
    pub const fn pending_mask(&self) -> u64 {
        self.pending
    }

    /// Highest-priority (lowest-numbered) pending interrupt.
    #[must_use]
    pub const fn lowest_pending(&self) -> Option<u8> {
        if self.pending == 0 {
            None
        } else {
            // trailing_zeros of a nonzero u64 is below 64.
            #[allow(clippy::cast_possible_truncation)]
            Some(self.pending.trailing_zeros() as u8)
        }
    }

    /// Attaches a probe to one interrupt.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn insert_probe(
        &mut self,
        inum: u8,
        probe: Arc<dyn InterruptProbe>,
    ) -> Result<(), SimError> {
        self.mask(inum)?;
        self.probes[usize::from(inum)].add(probe);
        Ok(())
    }

    /// Detaches a probe from one interrupt; returns `false` if it was not attached.
    pub fn remove_probe(&mut self, inum: u8, probe: &Arc<dyn InterruptProbe>) -> bool {
        self.mask(inum).is_ok() && self.probes[usize::from(inum)].remove(probe)
    }

    /// Attaches a probe that observes every interrupt.
    pub fn insert_global_probe(&mut self, probe: Arc<dyn InterruptProbe>) {
        self.global_probes.add(probe);
    }

    /// Detaches a global probe; returns `false` if it was not attached.
    pub fn remove_global_probe(&mut self, probe: &Arc<dyn InterruptProbe>) -> bool {
        self.global_probes.remove(probe)
    }

    /// Installs or clears the device notification of `inum`.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::InterruptOutOfRange`] for an unknown interrupt.
    pub fn register_notification(
        &mut self,
        inum: u8,
        notification: Option<Arc<dyn Notification>>,
    ) -> Result<(), SimError> {
        self.mask(inum)?;
        self.notifications[usize::from(inum)] = notification;
        Ok(())
    }
}

impl fmt::Debug for InterruptTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterruptTable")
            .field("num_interrupts", &self.num_interrupts)
            .field("posted", &format_args!("{:#018x}", self.posted))
            .field("enabled", &format_args!("{:#018x}", self.enabled))
            .field("pending", &format_args!("{:#018x}", self.pending))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::{AutoClear, InterruptTable, Notification};
    use crate::probe::InterruptProbe;
    use crate::{SimError, State, StateSnapshot};

    #[derive(Default)]
    struct Recorder {
        tag: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn push(&self, event: &str, inum: u8) {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("{} {event} {inum}", self.tag));
        }
    }

    impl InterruptProbe for Recorder {
        fn fire_before_invoke(&self, _state: &dyn State, inum: u8) {
            self.push("before_invoke", inum);
        }

        fn fire_after_invoke(&self, _state: &dyn State, inum: u8) {
            self.push("after_invoke", inum);
        }

        fn fire_when_enabled(&self, _state: &dyn State, inum: u8) {
            self.push("enabled", inum);
        }

        fn fire_when_disabled(&self, _state: &dyn State, inum: u8) {
            self.push("disabled", inum);
        }

        fn fire_when_posted(&self, _state: &dyn State, inum: u8) {
            self.push("posted", inum);
        }

        fn fire_when_unposted(&self, _state: &dyn State, inum: u8) {
            self.push("unposted", inum);
        }
    }

    fn table_with_recorders() -> (InterruptTable, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut table = InterruptTable::new(8).expect("valid table size");
        table.insert_global_probe(Arc::new(Recorder {
            tag: "global",
            log: Arc::clone(&log),
        }));
        table
            .insert_probe(
                5,
                Arc::new(Recorder {
                    tag: "local",
                    log: Arc::clone(&log),
                }),
            )
            .expect("interrupt in range");
        (table, log)
    }

    #[test]
    fn posting_while_disabled_is_not_pending_until_enabled() {
        let state = StateSnapshot::default();
        let (mut table, log) = table_with_recorders();

        table.post(5, &state).expect("in range");
        assert!(table.is_posted(5));
        assert!(!table.is_pending(5));

        table.enable(5, &state).expect("in range");
        assert!(table.is_pending(5));
        assert_eq!(table.lowest_pending(), Some(5));

        let log = log.lock().expect("log lock");
        let local_enables = log
            .iter()
            .filter(|entry| entry.as_str() == "local enabled 5")
            .count();
        assert_eq!(local_enables, 1);
    }

    #[test]
    fn per_interrupt_probes_fire_before_global_ones() {
        let state = StateSnapshot::default();
        let (mut table, log) = table_with_recorders();

        table.post(5, &state).expect("in range");
        table.unpost(5, &state).expect("in range");

        assert_eq!(
            *log.lock().expect("log lock"),
            vec![
                "local posted 5",
                "global posted 5",
                "local unposted 5",
                "global unposted 5",
            ]
        );
    }

    #[test]
    fn global_enable_and_disable_report_interrupt_zero() {
        let state = StateSnapshot::default();
        let (table, log) = table_with_recorders();
        table.enable_all(&state);
        table.disable_all(&state);
        assert_eq!(
            *log.lock().expect("log lock"),
            vec!["global enabled 0", "global disabled 0"]
        );
    }

    #[test]
    fn out_of_range_numbers_are_rejected() {
        let state = StateSnapshot::default();
        let mut table = InterruptTable::new(8).expect("valid table size");
        assert_eq!(
            table.post(8, &state),
            Err(SimError::InterruptOutOfRange { inum: 8, count: 8 })
        );
        assert!(table.enable(0, &state).is_err());
        assert!(!table.is_posted(200));
        assert!(InterruptTable::new(65).is_err());
        assert!(InterruptTable::new(64).is_ok());
    }

    #[test]
    fn highest_vector_of_a_full_table_fits_the_mask() {
        let state = StateSnapshot::default();
        let mut table = InterruptTable::new(64).expect("valid table size");
        table.post(63, &state).expect("in range");
        table.enable(63, &state).expect("in range");
        assert_eq!(table.pending_mask(), 1 << 63);
        assert_eq!(table.lowest_pending(), Some(63));
    }

    #[test]
    fn auto_clear_unposts_at_invoke() {
        let state = StateSnapshot::default();
        let (mut table, log) = table_with_recorders();
        table
            .register_notification(5, Some(Arc::new(AutoClear)))
            .expect("in range");
        table.post(5, &state).expect("in range");
        table.enable(5, &state).expect("in range");

        table.before_invoke(5, &state);
        assert!(!table.is_posted(5));
        assert!(!table.is_pending(5));

        let log = log.lock().expect("log lock");
        let before = log
            .iter()
            .position(|entry| entry == "local before_invoke 5")
            .expect("before_invoke recorded");
        let unposted = log
            .iter()
            .position(|entry| entry == "local unposted 5")
            .expect("unposted recorded");
        assert!(before < unposted);
    }

    #[derive(Default)]
    struct ForceCounter(AtomicUsize);

    impl Notification for ForceCounter {
        fn force(&self, _inum: u8) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn force_posts_and_notifies_device() {
        let state = StateSnapshot::default();
        let counter = Arc::new(ForceCounter::default());
        let mut table = InterruptTable::new(8).expect("valid table size");
        table
            .register_notification(3, Some(counter.clone()))
            .expect("in range");

        table.force(3, &state).expect("in range");
        assert!(table.is_posted(3));
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);

        table.post(3, &state).expect("in range");
        assert_eq!(counter.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn removing_unattached_probe_is_a_no_op() {
        let probe: Arc<dyn InterruptProbe> = Arc::new(Recorder::default());
        let mut table = InterruptTable::new(8).expect("valid table size");
        assert!(!table.remove_probe(2, &probe));
        assert!(!table.remove_global_probe(&probe));
        assert!(!table.remove_probe(99, &probe));
    }
}
