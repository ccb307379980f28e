//! Instrumentation callback traits and the identity-keyed lists that hold them.
//!
//! Every callback receives a read-only [`State`] view of the node. All methods default to
//! no-ops so an implementation only overrides the hooks it cares about. Registration and
//! removal always go through `Arc` handles; removal compares pointers, never values.

use std::fmt;
use std::sync::Arc;

use crate::State;

/// Instruction-level instrumentation, fired around one instruction or around every one.
pub trait Probe: Send + Sync {
    /// Called before the instruction at `pc` executes.
    fn fire_before(&self, state: &dyn State, pc: u32) {
        let _ = (state, pc);
    }

    /// Called after the instruction at `pc` executed and committed.
    fn fire_after(&self, state: &dyn State, pc: u32) {
        let _ = (state, pc);
    }
}

/// Memory-level instrumentation attached to one segment address.
pub trait Watch: Send + Sync {
    /// Called before a read of `addr`.
    fn fire_before_read(&self, state: &dyn State, addr: u32) {
        let _ = (state, addr);
    }

    /// Called after a read of `addr` produced `value`.
    fn fire_after_read(&self, state: &dyn State, addr: u32, value: u8) {
        let _ = (state, addr, value);
    }

    /// Called before `value` is written to `addr`.
    fn fire_before_write(&self, state: &dyn State, addr: u32, value: u8) {
        let _ = (state, addr, value);
    }

    /// Called after `value` was written to `addr`.
    fn fire_after_write(&self, state: &dyn State, addr: u32, value: u8) {
        let _ = (state, addr, value);
    }
}

/// Interrupt-table instrumentation. Global probes see `inum == 0` for the global
/// enable and disable events.
pub trait InterruptProbe: Send + Sync {
    /// Delivery of `inum` is about to start.
    fn fire_before_invoke(&self, state: &dyn State, inum: u8) {
        let _ = (state, inum);
    }

    /// Control reached the vector of `inum`.
    fn fire_after_invoke(&self, state: &dyn State, inum: u8) {
        let _ = (state, inum);
    }

    /// `inum` was enabled.
    fn fire_when_enabled(&self, state: &dyn State, inum: u8) {
        let _ = (state, inum);
    }

    /// `inum` was disabled.
    fn fire_when_disabled(&self, state: &dyn State, inum: u8) {
        let _ = (state, inum);
    }

    /// `inum` was posted.
    fn fire_when_posted(&self, state: &dyn State, inum: u8) {
        let _ = (state, inum);
    }

    /// `inum` was unposted.
    fn fire_when_unposted(&self, state: &dyn State, inum: u8) {
        let _ = (state, inum);
    }
}

/// Finite-state-machine instrumentation.
pub trait FsmProbe: Send + Sync {
    /// Called before a transition from `before` to `after` starts.
    fn fire_before_transition(&self, before: usize, after: usize) {
        let _ = (before, after);
    }

    /// Called once the machine has entered `after`.
    fn fire_after_transition(&self, before: usize, after: usize) {
        let _ = (before, after);
    }
}

/// Ordered list of shared callbacks with copy-on-write storage.
///
/// [`Multicast::snapshot`] is a single reference-count bump, so callers can fire a
/// stable list while the owner is mutated.
pub struct Multicast<T: ?Sized> {
    items: Arc<[Arc<T>]>,
}

impl<T: ?Sized> Multicast<T> {
    /// Creates an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self {
            items: Arc::from(Vec::new()),
        }
    }

    /// Appends an item; the same item may be registered more than once.
    pub fn add(&mut self, item: Arc<T>) {
        let mut items = self.items.to_vec();
        items.push(item);
        self.items = items.into();
    }

    /// Removes the first entry that is the same allocation as `item`.
    ///
    /// Returns `false` when `item` was never registered.
    pub fn remove(&mut self, item: &Arc<T>) -> bool {
        let Some(position) = self
            .items
            .iter()
            .position(|entry| std::ptr::addr_eq(Arc::as_ptr(entry), Arc::as_ptr(item)))
        else {
            return false;
        };
        let mut items = self.items.to_vec();
        items.remove(position);
        self.items = items.into();
        true
    }

    /// Returns `true` when `item` is registered.
    #[must_use]
    pub fn contains(&self, item: &Arc<T>) -> bool {
        self.items
            .iter()
            .any(|entry| std::ptr::addr_eq(Arc::as_ptr(entry), Arc::as_ptr(item)))
    }

    /// Number of registered items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns `true` when nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<T>> {
        self.items.iter()
    }

    /// Stable copy of the current list.
    #[must_use]
    pub fn snapshot(&self) -> Arc<[Arc<T>]> {
        Arc::clone(&self.items)
    }
}

impl<T: ?Sized> Default for Multicast<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Clone for Multicast<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T: ?Sized> fmt::Debug for Multicast<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multicast")
            .field("len", &self.items.len())
            .finish()
    }
}
