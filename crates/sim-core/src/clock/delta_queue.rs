//! Delta list of pending clock events.
//!
//! Each link stores the distance in cycles from the previous link, so advancing the
//! clock only touches the head. Events scheduled for the same cycle share a link and
//! fire in insertion order.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use crate::Event;

struct Link {
    delta: u64,
    events: Vec<Arc<dyn Event>>,
}

/// Ordered queue of events keyed by cycles-from-now.
#[derive(Default)]
pub struct DeltaQueue {
    links: VecDeque<Link>,
}

impl DeltaQueue {
    /// Creates an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when no event is scheduled.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    /// Number of scheduled events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.links.iter().map(|link| link.events.len()).sum()
    }

    /// Cycles until the head link is due.
    #[must_use]
    pub fn head_delta(&self) -> Option<u64> {
        self.links.front().map(|link| link.delta)
    }

    /// Schedules `event` to fire `cycles` from now.
    pub fn insert(&mut self, event: Arc<dyn Event>, cycles: u64) {
        let mut remaining = cycles;
        let mut position = 0;
        while let Some(link) = self.links.get_mut(position) {
            if remaining < link.delta {
                link.delta -= remaining;
                self.links.insert(
                    position,
                    Link {
                        delta: remaining,
                        events: vec![event],
                    },
                );
                return;
            }
            if remaining == link.delta {
                link.events.push(event);
                return;
            }
            remaining -= link.delta;
            position += 1;
        }
        self.links.push_back(Link {
            delta: remaining,
            events: vec![event],
        });
    }

    /// Removes the first scheduled occurrence of `event`, compared by identity.
    ///
    /// A link left without events gives its delta to its successor so later events
    /// keep their absolute times.
    pub fn remove(&mut self, event: &Arc<dyn Event>) -> bool {
        for position in 0..self.links.len() {
            let link = &mut self.links[position];
            let Some(index) = link
                .events
                .iter()
                .position(|entry| std::ptr::addr_eq(Arc::as_ptr(entry), Arc::as_ptr(event)))
            else {
                continue;
            };
            link.events.remove(index);
            if link.events.is_empty() {
                let delta = link.delta;
                self.links.remove(position);
                if let Some(next) = self.links.get_mut(position) {
                    next.delta += delta;
                }
            }
            return true;
        }
        false
    }

    /// Pops the head link when it falls due within `budget` cycles.
    ///
    /// Returns the head's delta and its events; the caller owns the budget
    /// bookkeeping and fires the events.
    pub fn pop_due(&mut self, budget: u64) -> Option<(u64, Vec<Arc<dyn Event>>)> {
        if self.links.front()?.delta > budget {
            return None;
        }
        self.links.pop_front().map(|link| (link.delta, link.events))
    }

    /// Moves the head link `cycles` closer; used after all due links were popped.
    pub fn consume(&mut self, cycles: u64) {
        if let Some(head) = self.links.front_mut() {
            head.delta = head.delta.saturating_sub(cycles);
        }
    }

    /// Absolute offsets (cycles from now) of every event, in firing order.
    #[must_use]
    pub fn offsets(&self) -> Vec<u64> {
        let mut at = 0;
        let mut offsets = Vec::new();
        for link in &self.links {
            at += link.delta;
            offsets.resize(offsets.len() + link.events.len(), at);
        }
        offsets
    }
}

impl fmt::Debug for DeltaQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeltaQueue")
            .field("offsets", &self.offsets())
            .finish()
    }
}
