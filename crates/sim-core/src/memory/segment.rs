use std::fmt;
use std::sync::Arc;

use crate::probe::{Multicast, Watch};
use crate::{SimError, State};

type WatchList = Arc<[Arc<dyn Watch>]>;

/// Owner-side accessor that is told when a segment's backing array is reallocated.
pub trait Sharer: Send {
    /// Called after [`Segment::resize`] with the new length.
    fn update(&mut self, len: usize);
}

/// Bounds-checked byte-addressable memory with optional per-address watches.
///
/// Instrumented accesses ([`Segment::read`], [`Segment::write`]) never fail: an
/// out-of-range access notifies the error watches and reads as the fill byte. The
/// inspection accessors ([`Segment::get`], [`Segment::set`]) report
/// [`SimError::AddressOutOfBounds`] instead.
pub struct Segment {
    name: String,
    data: Vec<u8>,
    default_value: u8,
    watches: Option<Vec<Multicast<dyn Watch>>>,
    error_watches: Multicast<dyn Watch>,
    sharer: Option<Box<dyn Sharer>>,
}

impl Segment {
    /// Creates a segment of `len` bytes filled with `default_value`.
    #[must_use]
    pub fn new(name: impl Into<String>, len: usize, default_value: u8) -> Self {
        Self {
            name: name.into(),
            data: vec![default_value; len],
            default_value,
            watches: None,
            error_watches: Multicast::new(),
            sharer: None,
        }
    }

    /// Segment name used in error reports.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` for a zero-length segment.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fill byte for fresh memory and for out-of-range instrumented reads.
    #[must_use]
    pub const fn default_value(&self) -> u8 {
        self.default_value
    }

    fn index(&self, addr: u32) -> Option<usize> {
        usize::try_from(addr)
            .ok()
            .filter(|index| *index < self.data.len())
    }

    fn out_of_bounds(&self, addr: u32) -> SimError {
        SimError::AddressOutOfBounds {
            segment: self.name.clone(),
            addr,
            pc: None,
        }
    }

    /// Instrumented read.
    pub fn read(&self, addr: u32, state: &dyn State) -> u8 {
        let Some(index) = self.index(addr) else {
            self.fire_read_error(addr, state);
            return self.default_value;
        };
        let Some(watches) = self.watches_at(addr) else {
            return self.data[index];
        };
        for watch in watches.iter() {
            watch.fire_before_read(state, addr);
        }
        let value = self.data[index];
        for watch in watches.iter() {
            watch.fire_after_read(state, addr, value);
        }
        value
    }

    /// Instrumented write.
    pub fn write(&mut self, addr: u32, value: u8, state: &dyn State) {
        let Some(index) = self.index(addr) else {
            self.fire_write_error(addr, value, state);
            return;
        };
        let Some(watches) = self.watches_at(addr) else {
            self.data[index] = value;
            return;
        };
        for watch in watches.iter() {
            watch.fire_before_write(state, addr, value);
        }
        self.data[index] = value;
        for watch in watches.iter() {
            watch.fire_after_write(state, addr, value);
        }
    }

    /// Uninstrumented read for debuggers and tooling.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::AddressOutOfBounds`] when `addr` is outside the segment.
    pub fn get(&self, addr: u32) -> Result<u8, SimError> {
        self.index(addr)
            .map(|index| self.data[index])
            .ok_or_else(|| self.out_of_bounds(addr))
    }

    /// Uninstrumented write for debuggers and tooling.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::AddressOutOfBounds`] when `addr` is outside the segment.
    pub fn set(&mut self, addr: u32, value: u8) -> Result<(), SimError> {
        let index = self.index(addr).ok_or_else(|| self.out_of_bounds(addr))?;
        self.data[index] = value;
        Ok(())
    }

    /// Adds a watch at `addr`; several watches may share an address.
    ///
    /// # Errors
    ///
    /// Returns [`SimError::AddressOutOfBounds`] when `addr` is outside the segment.
    pub fn insert_watch(&mut self, addr: u32, watch: Arc<dyn Watch>) -> Result<(), SimError> {
        let index = self.index(addr).ok_or_else(|| self.out_of_bounds(addr))?;
        let len = self.data.len();
        let table = self
            .watches
            .get_or_insert_with(|| vec![Multicast::new(); len]);
        table[index].add(watch);
        Ok(())
    }

    /// Removes `watch` from `addr`; returns `false` if it was not registered there.
    pub fn remove_watch(&mut self, addr: u32, watch: &Arc<dyn Watch>) -> bool {
        let Some(index) = self.index(addr) else {
            return false;
        };
        self.watches
            .as_mut()
            .is_some_and(|table| table[index].remove(watch))
    }

    /// Adds a watch notified about out-of-range instrumented accesses.
    pub fn insert_error_watch(&mut self, watch: Arc<dyn Watch>) {
        self.error_watches.add(watch);
    }

    /// Removes an error watch; returns `false` if it was not registered.
    pub fn remove_error_watch(&mut self, watch: &Arc<dyn Watch>) -> bool {
        self.error_watches.remove(watch)
    }

    /// Number of watches registered at `addr`.
    #[must_use]
    pub fn watch_count(&self, addr: u32) -> usize {
        self.index(addr)
            .and_then(|index| self.watches.as_ref().map(|table| table[index].len()))
            .unwrap_or(0)
    }

    /// Stable copy of the watches at `addr`, or `None` on the fast path.
    pub(crate) fn watches_at(&self, addr: u32) -> Option<WatchList> {
        let table = self.watches.as_ref()?;
        let list = &table[self.index(addr)?];
        (!list.is_empty()).then(|| list.snapshot())
    }

    pub(crate) fn fire_read_error(&self, addr: u32, state: &dyn State) {
        for watch in self.error_watches.iter() {
            watch.fire_before_read(state, addr);
        }
    }

    pub(crate) fn fire_write_error(&self, addr: u32, value: u8, state: &dyn State) {
        for watch in self.error_watches.iter() {
            watch.fire_before_write(state, addr, value);
        }
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Hands the backing array to a trusted owner-side accessor.
    ///
    /// Accesses through the returned slice bypass every watch. `sharer` is kept and
    /// notified whenever the array is reallocated by [`Segment::resize`].
    pub fn share(&mut self, sharer: Box<dyn Sharer>) -> &mut [u8] {
        self.sharer = Some(sharer);
        &mut self.data
    }

    /// Reallocates the backing array; new bytes take the fill value and watches past
    /// the new end are dropped.
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, self.default_value);
        if let Some(table) = self.watches.as_mut() {
            table.resize_with(len, Multicast::new);
        }
        if let Some(sharer) = self.sharer.as_mut() {
            sharer.update(len);
        }
    }
}

impl fmt::Debug for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .field("default_value", &self.default_value)
            .field("watched", &self.watches.is_some())
            .field("error_watches", &self.error_watches.len())
            .finish_non_exhaustive()
    }
}
