use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};

use super::error::RingError;
use super::event::{Event, EventId};

/// What a filler does when no slot is Free
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Wait (up to the acquisition timeout) for a worker to free a slot
    #[default]
    Block,
    /// Take the oldest Filled slot nobody is processing or viewing, dropping its event
    Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Free,
    Filling,
    Filled,
    Processing,
}

impl SlotState {
    fn name(&self) -> &'static str {
        match self {
            SlotState::Free => "Free",
            SlotState::Filling => "Filling",
            SlotState::Filled => "Filled",
            SlotState::Processing => "Processing",
        }
    }
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Counters over the life of the ring
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStatistics {
    pub filled: u64,
    pub processed: u64,
    pub invalid: u64,
    pub overwritten: u64,
}

/// Exclusive right to write the event of one slot. Released with
/// [`EventSlotRing::release_filled`] or [`EventSlotRing::abandon_fill`].
#[derive(Debug)]
pub struct FillHandle {
    index: usize,
    generation: u64,
}

/// Exclusive right to process the event of one slot
#[derive(Debug)]
pub struct ProcessHandle {
    index: usize,
    generation: u64,
    id: EventId,
    valid: bool,
}

/// Shared, read-only right to inspect the event of one slot
#[derive(Debug)]
pub struct ViewHandle {
    index: usize,
    generation: u64,
    id: EventId,
}

/// Handles which grant read access to a slot's event
pub trait SlotHandle {
    fn index(&self) -> usize;
}

impl FillHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

impl ProcessHandle {
    pub fn id(&self) -> EventId {
        self.id
    }

    /// False when the filler flagged the event as invalid
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl ViewHandle {
    pub fn id(&self) -> EventId {
        self.id
    }
}

impl SlotHandle for ProcessHandle {
    fn index(&self) -> usize {
        self.index
    }
}

impl SlotHandle for ViewHandle {
    fn index(&self) -> usize {
        self.index
    }
}

/// How a viewer picks among the viewable slots. The most recently filled match wins.
pub enum ViewSelector {
    Latest,
    IdRange { first: EventId, last: EventId },
    Predicate(Box<dyn Fn(EventId) -> bool + Send + Sync>),
}

impl ViewSelector {
    fn matches(&self, id: EventId) -> bool {
        match self {
            ViewSelector::Latest => true,
            ViewSelector::IdRange { first, last } => *first <= id && id <= *last,
            ViewSelector::Predicate(f) => f(id),
        }
    }
}

impl fmt::Debug for ViewSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewSelector::Latest => f.write_str("Latest"),
            ViewSelector::IdRange { first, last } => write!(f, "IdRange({first}..={last})"),
            ViewSelector::Predicate(_) => f.write_str("Predicate"),
        }
    }
}

#[derive(Debug, Clone)]
struct SlotMeta {
    state: SlotState,
    generation: u64,
    sequence: u64,
    id: EventId,
    valid: bool,
    viewers: usize,
}

impl SlotMeta {
    fn new() -> Self {
        Self {
            state: SlotState::Free,
            generation: 0,
            sequence: 0,
            id: EventId::default(),
            valid: false,
            viewers: 0,
        }
    }
}

#[derive(Debug)]
struct RingState {
    slots: Vec<SlotMeta>,
    next_fill: usize,
    next_sequence: u64,
    stats: RingStatistics,
}

impl RingState {
    /// Find the slot a filler may take. The bool is true when a Filled event is dropped.
    fn find_fillable(&self, policy: Backpressure) -> Option<(usize, bool)> {
        let capacity = self.slots.len();
        for offset in 0..capacity {
            let index = (self.next_fill + offset) % capacity;
            let slot = &self.slots[index];
            if slot.state == SlotState::Free && slot.viewers == 0 {
                return Some((index, false));
            }
        }
        if policy == Backpressure::Overwrite {
            return self
                .slots
                .iter()
                .enumerate()
                .filter(|(_, s)| s.state == SlotState::Filled && s.viewers == 0)
                .min_by_key(|(_, s)| s.sequence)
                .map(|(index, _)| (index, true));
        }
        None
    }

    fn find_processable(&self) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.state == SlotState::Filled)
            .min_by_key(|(_, s)| s.sequence)
            .map(|(index, _)| index)
    }

    fn find_viewable(&self, selector: &ViewSelector) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| {
                matches!(s.state, SlotState::Filled | SlotState::Processing)
                    && s.valid
                    && selector.matches(s.id)
            })
            .max_by_key(|(_, s)| s.sequence)
            .map(|(index, _)| index)
    }

    fn check(
        &self,
        index: usize,
        generation: u64,
        expected: SlotState,
    ) -> Result<(), RingError> {
        let slot = self.slots.get(index).ok_or(RingError::StaleHandle {
            index,
            handle: generation,
            slot: 0,
        })?;
        if slot.generation != generation {
            return Err(RingError::StaleHandle {
                index,
                handle: generation,
                slot: slot.generation,
            });
        }
        if slot.state != expected {
            return Err(RingError::WrongState {
                index,
                found: slot.state.name(),
                expected: expected.name(),
            });
        }
        Ok(())
    }

    fn all_free(&self) -> bool {
        self.slots.iter().all(|s| s.state == SlotState::Free)
    }
}

/// Fixed-capacity circular array of event slots shared by one filler, the worker
/// pool and any number of viewers.
///
/// Each slot moves through `Free -> Filling -> Filled -> Processing -> Free`. Viewers
/// attach to Filled or Processing slots without changing their state, and a slot with
/// viewers attached is never handed to the filler. All acquisitions take a timeout
/// and return `None` when it elapses, so callers can check their shutdown flags.
///
/// Workers receive Filled slots in fill order.
#[derive(Debug)]
pub struct EventSlotRing {
    events: Vec<RwLock<Event>>,
    state: Mutex<RingState>,
    changed: Condvar,
    policy: Backpressure,
}

impl EventSlotRing {
    /// Create a ring with `capacity` preallocated events
    pub fn new(capacity: usize, policy: Backpressure) -> Result<Self, RingError> {
        if capacity == 0 {
            return Err(RingError::InvalidCapacity);
        }
        Ok(Self {
            events: (0..capacity).map(|_| RwLock::new(Event::new())).collect(),
            state: Mutex::new(RingState {
                slots: vec![SlotMeta::new(); capacity],
                next_fill: 0,
                next_sequence: 0,
                stats: RingStatistics::default(),
            }),
            changed: Condvar::new(),
            policy,
        })
    }

    pub fn capacity(&self) -> usize {
        self.events.len()
    }

    pub fn policy(&self) -> Backpressure {
        self.policy
    }

    pub fn acquire_fillable(&self, timeout: Duration) -> Option<FillHandle> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some((index, overwritten)) = state.find_fillable(self.policy) {
                let capacity = state.slots.len();
                let slot = &mut state.slots[index];
                if overwritten {
                    spdlog::debug!("Overwriting unprocessed event {} in slot {}", slot.id, index);
                }
                slot.state = SlotState::Filling;
                slot.generation += 1;
                slot.valid = false;
                let generation = slot.generation;
                state.next_fill = (index + 1) % capacity;
                if overwritten {
                    state.stats.overwritten += 1;
                }
                return Some(FillHandle { index, generation });
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Write access to the event being filled.
    ///
    /// # Panics
    /// If `handle` was issued by a larger ring.
    pub fn with_event_mut<R>(&self, handle: &FillHandle, f: impl FnOnce(&mut Event) -> R) -> R {
        let mut event = self.events[handle.index].write();
        f(&mut event)
    }

    /// Publish a filled slot. Invalid events still occupy a ring cycle.
    pub fn release_filled(&self, handle: FillHandle, valid: bool) -> Result<(), RingError> {
        let id = self
            .events
            .get(handle.index)
            .map(|event| event.read().id())
            .unwrap_or_default();
        let mut state = self.state.lock();
        state.check(handle.index, handle.generation, SlotState::Filling)?;
        let sequence = state.next_sequence;
        state.next_sequence += 1;
        let slot = &mut state.slots[handle.index];
        slot.state = SlotState::Filled;
        slot.sequence = sequence;
        slot.id = id;
        slot.valid = valid;
        state.stats.filled += 1;
        if !valid {
            state.stats.invalid += 1;
        }
        self.changed.notify_all();
        Ok(())
    }

    /// Return a slot to Free without publishing its event
    pub fn abandon_fill(&self, handle: FillHandle) -> Result<(), RingError> {
        let mut state = self.state.lock();
        state.check(handle.index, handle.generation, SlotState::Filling)?;
        state.slots[handle.index].state = SlotState::Free;
        self.changed.notify_all();
        Ok(())
    }

    pub fn acquire_processable(&self, timeout: Duration) -> Option<ProcessHandle> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(index) = state.find_processable() {
                let slot = &mut state.slots[index];
                slot.state = SlotState::Processing;
                return Some(ProcessHandle {
                    index,
                    generation: slot.generation,
                    id: slot.id,
                    valid: slot.valid,
                });
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    pub fn release_processed(&self, handle: ProcessHandle) -> Result<(), RingError> {
        let mut state = self.state.lock();
        state.check(handle.index, handle.generation, SlotState::Processing)?;
        state.slots[handle.index].state = SlotState::Free;
        state.stats.processed += 1;
        self.changed.notify_all();
        Ok(())
    }

    /// Attach a viewer to the most recently filled valid slot matching `selector`
    pub fn acquire_view(&self, selector: &ViewSelector, timeout: Duration) -> Option<ViewHandle> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(index) = state.find_viewable(selector) {
                let slot = &mut state.slots[index];
                slot.viewers += 1;
                return Some(ViewHandle {
                    index,
                    generation: slot.generation,
                    id: slot.id,
                });
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    pub fn release_view(&self, handle: ViewHandle) -> Result<(), RingError> {
        let mut state = self.state.lock();
        let slot = state.slots.get_mut(handle.index).ok_or(RingError::StaleHandle {
            index: handle.index,
            handle: handle.generation,
            slot: 0,
        })?;
        if slot.generation != handle.generation || slot.viewers == 0 {
            return Err(RingError::StaleHandle {
                index: handle.index,
                handle: handle.generation,
                slot: slot.generation,
            });
        }
        slot.viewers -= 1;
        if slot.viewers == 0 {
            self.changed.notify_all();
        }
        Ok(())
    }

    /// Read access to the event behind a processing or viewing handle.
    ///
    /// # Panics
    /// If `handle` was issued by a larger ring.
    pub fn with_event<R>(&self, handle: &impl SlotHandle, f: impl FnOnce(&Event) -> R) -> R {
        let event = self.events[handle.index()].read();
        f(&event)
    }

    /// Read guard on a viewed event. Drop it before releasing the view.
    ///
    /// # Panics
    /// If `handle` was issued by a larger ring.
    pub fn read_event(&self, handle: &ViewHandle) -> RwLockReadGuard<'_, Event> {
        self.events[handle.index].read()
    }

    /// Block until every slot has returned to Free
    pub fn drain_until_empty(&self) {
        let mut state = self.state.lock();
        while !state.all_free() {
            self.changed.wait(&mut state);
        }
    }

    /// Like [`EventSlotRing::drain_until_empty`] but gives up after `timeout`.
    /// Returns true if the ring drained.
    pub fn drain_until_empty_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.all_free() {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.all_free();
            }
        }
        true
    }

    pub fn statistics(&self) -> RingStatistics {
        self.state.lock().stats
    }

    pub fn state_of(&self, index: usize) -> Option<SlotState> {
        self.state.lock().slots.get(index).map(|s| s.state)
    }

    /// Number of slots currently in `state`
    pub fn count_in(&self, state: SlotState) -> usize {
        self.state
            .lock()
            .slots
            .iter()
            .filter(|s| s.state == state)
            .count()
    }

    /// Wake every waiter so it can re-check its own shutdown flag
    pub fn notify_all(&self) {
        let _state = self.state.lock();
        self.changed.notify_all();
    }
}
