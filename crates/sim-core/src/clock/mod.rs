//! Cycle counting and event scheduling.

pub mod delta_queue;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::trace;

pub use delta_queue::DeltaQueue;

use crate::Event;

/// Cycle counter with an attached event queue.
///
/// Clocks are shared between the interpreter, devices and state machines, so every
/// operation takes `&self`.
pub trait Clock: Send + Sync {
    /// Frequency in hertz.
    fn hz(&self) -> u64;

    /// Cycles elapsed since creation.
    fn count(&self) -> u64;

    /// Moves time forward, firing every event that falls due on the way.
    fn advance(&self, cycles: u64);

    /// Schedules `event` to fire `cycles` from now; 0 fires on the next advance.
    fn insert_event(&self, event: Arc<dyn Event>, cycles: u64);

    /// Cancels one scheduled occurrence of `event`; returns `false` if none was queued.
    fn remove_event(&self, event: &Arc<dyn Event>) -> bool;
}

#[derive(Debug, Default)]
struct Inner {
    count: u64,
    queue: DeltaQueue,
}

/// The node's main clock.
///
/// Cloning yields another handle to the same counter and queue. Events fire with the
/// internal lock released, so an event may schedule or cancel other events.
#[derive(Clone)]
pub struct MainClock {
    hz: u64,
    inner: Arc<Mutex<Inner>>,
}

impl MainClock {
    /// Creates a clock at zero cycles.
    #[must_use]
    pub fn new(hz: u64) -> Self {
        Self {
            hz,
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cycles until the next scheduled event.
    #[must_use]
    pub fn first_event_time(&self) -> Option<u64> {
        self.lock().queue.head_delta()
    }

    /// Number of scheduled events.
    #[must_use]
    pub fn pending_events(&self) -> usize {
        self.lock().queue.len()
    }

    /// Jumps straight to the next event and fires it; with an empty queue time moves
    /// by a single cycle. Returns the cycles skipped.
    pub fn skip_ahead(&self) -> u64 {
        let cycles = self.first_event_time().unwrap_or(1);
        trace!("skipping {cycles} cycles to the next event");
        self.advance(cycles);
        cycles
    }

    /// Converts cycles to whole milliseconds at this clock's frequency.
    #[must_use]
    pub fn cycles_to_millis(&self, cycles: u64) -> u64 {
        if self.hz == 0 {
            return 0;
        }
        let millis = u128::from(cycles) * 1000 / u128::from(self.hz);
        u64::try_from(millis).unwrap_or(u64::MAX)
    }

    /// Converts milliseconds to cycles at this clock's frequency.
    #[must_use]
    pub fn millis_to_cycles(&self, millis: u64) -> u64 {
        let cycles = u128::from(millis) * u128::from(self.hz) / 1000;
        u64::try_from(cycles).unwrap_or(u64::MAX)
    }
}

impl Clock for MainClock {
    fn hz(&self) -> u64 {
        self.hz
    }

    fn count(&self) -> u64 {
        self.lock().count
    }

    fn advance(&self, cycles: u64) {
        let mut remaining = cycles;
        loop {
            let due = {
                let mut inner = self.lock();
                if let Some((delta, events)) = inner.queue.pop_due(remaining) {
                    inner.count += delta;
                    remaining -= delta;
                    events
                } else {
                    inner.count += remaining;
                    inner.queue.consume(remaining);
                    return;
                }
            };
            for event in due {
                event.fire();
            }
        }
    }

    fn insert_event(&self, event: Arc<dyn Event>, cycles: u64) {
        self.lock().queue.insert(event, cycles);
    }

    fn remove_event(&self, event: &Arc<dyn Event>) -> bool {
        self.lock().queue.remove(event)
    }
}

impl fmt::Debug for MainClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("MainClock")
            .field("hz", &self.hz)
            .field("count", &inner.count)
            .field("queue", &inner.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::{Clock, MainClock};
    use crate::Event;

    fn recording(log: &Arc<Mutex<Vec<(String, u64)>>>, clock: &MainClock, tag: &str) -> Arc<dyn Event> {
        let log = Arc::clone(log);
        let clock = clock.clone();
        let tag = tag.to_owned();
        Arc::new(move || {
            log.lock()
                .expect("log lock")
                .push((tag.clone(), clock.count()));
        })
    }

    #[test]
    fn events_fire_at_their_cycle_in_insertion_order() {
        let clock = MainClock::new(1_000_000);
        let log = Arc::new(Mutex::new(Vec::new()));
        clock.insert_event(recording(&log, &clock, "b"), 5);
        clock.insert_event(recording(&log, &clock, "a"), 3);
        clock.insert_event(recording(&log, &clock, "c"), 5);

        clock.advance(4);
        assert_eq!(clock.count(), 4);
        clock.advance(10);
        assert_eq!(clock.count(), 14);

        assert_eq!(
            *log.lock().expect("log lock"),
            vec![
                ("a".to_owned(), 3),
                ("b".to_owned(), 5),
                ("c".to_owned(), 5),
            ]
        );
    }

    #[test]
    fn zero_delay_event_fires_on_the_next_advance() {
        let clock = MainClock::new(1_000);
        let log = Arc::new(Mutex::new(Vec::new()));
        clock.insert_event(recording(&log, &clock, "now"), 0);
        assert!(log.lock().expect("log lock").is_empty());

        clock.advance(0);
        assert_eq!(*log.lock().expect("log lock"), vec![("now".to_owned(), 0)]);
    }

    #[test]
    fn removed_event_never_fires_and_later_events_keep_their_time() {
        let clock = MainClock::new(1_000);
        let log = Arc::new(Mutex::new(Vec::new()));
        let cancelled = recording(&log, &clock, "cancelled");
        clock.insert_event(Arc::clone(&cancelled), 2);
        clock.insert_event(recording(&log, &clock, "kept"), 7);

        assert!(clock.remove_event(&cancelled));
        assert!(!clock.remove_event(&cancelled));
        clock.advance(10);

        assert_eq!(*log.lock().expect("log lock"), vec![("kept".to_owned(), 7)]);
    }

    #[test]
    fn event_may_reschedule_itself_through_a_clone_of_the_clock() {
        let clock = MainClock::new(1_000);
        let fired = Arc::new(Mutex::new(Vec::new()));
        let inner_clock = clock.clone();
        let inner_fired = Arc::clone(&fired);
        let follow_up: Arc<dyn Event> = Arc::new(move || {
            inner_fired
                .lock()
                .expect("fired lock")
                .push(inner_clock.count());
        });
        let chain_clock = clock.clone();
        clock.insert_event(
            Arc::new(move || chain_clock.insert_event(Arc::clone(&follow_up), 3)),
            2,
        );

        clock.advance(10);
        assert_eq!(*fired.lock().expect("fired lock"), vec![5]);
    }

    #[test]
    fn skip_ahead_lands_on_the_next_event_or_moves_one_cycle() {
        let clock = MainClock::new(1_000);
        assert_eq!(clock.skip_ahead(), 1);
        assert_eq!(clock.count(), 1);

        let log = Arc::new(Mutex::new(Vec::new()));
        clock.insert_event(recording(&log, &clock, "wake"), 40);
        assert_eq!(clock.first_event_time(), Some(40));
        assert_eq!(clock.skip_ahead(), 40);
        assert_eq!(clock.count(), 41);
        assert_eq!(*log.lock().expect("log lock"), vec![("wake".to_owned(), 41)]);
        assert_eq!(clock.pending_events(), 0);
    }

    #[test]
    fn millisecond_conversions_use_the_frequency() {
        let clock = MainClock::new(7_372_800);
        assert_eq!(clock.millis_to_cycles(1_000), 7_372_800);
        assert_eq!(clock.cycles_to_millis(7_372_800 * 3), 3_000);
        assert_eq!(MainClock::new(0).cycles_to_millis(10), 0);
    }
}
