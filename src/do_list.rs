//! The two event queues: the outbound staging FIFO and the execution queue.
//!
//! Every machine holds its own independent copy of the execution queue
//! ("DoList"); consistency across machines is enforced by the protocol, not
//! by shared memory. Entries leave the DoList only from the head, once
//! executed or once their frame has irrevocably passed.

use std::collections::VecDeque;

use crate::error::LockstepError;
use crate::event::{Event, EventData};
use crate::Frame;

/// Default capacity of the execution queue, in events.
pub const DEFAULT_DO_LIST_CAPACITY: usize = 32_768;

/// The ordered collection of all events, local and remote, awaiting or
/// having undergone execution.
///
/// Bounded: [`push`](DoList::push) fails with
/// [`LockstepError::QueueFull`] at capacity, which is a fatal,
/// caller-visible condition. Removal happens only via
/// [`clean`](DoList::clean), which trims from the head; there is no random
/// removal, so relative order is stable across machines.
#[derive(Debug, Clone)]
pub struct DoList {
    events: VecDeque<Event>,
    capacity: usize,
}

impl DoList {
    /// Creates an empty queue bounded to `capacity` events.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        DoList {
            events: VecDeque::new(),
            capacity,
        }
    }

    /// The configured capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of events currently queued, executed or not.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the queue is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Appends an event.
    ///
    /// # Errors
    ///
    /// [`LockstepError::QueueFull`] when at capacity. Callers must not
    /// swallow this: a full queue means commands can no longer be
    /// guaranteed to execute on every machine.
    pub fn push(&mut self, event: Event) -> Result<(), LockstepError> {
        if self.events.len() >= self.capacity {
            return Err(LockstepError::QueueFull {
                capacity: self.capacity,
            });
        }
        self.events.push_back(event);
        Ok(())
    }

    /// Iterates events in queue order.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Iterates events mutably in queue order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Event> {
        self.events.iter_mut()
    }

    /// Returns the event at `index` in queue order.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&Event> {
        self.events.get(index)
    }

    /// Returns the event at `index` mutably.
    pub fn get_mut(&mut self, index: usize) -> Option<&mut Event> {
        self.events.get_mut(index)
    }

    /// Trims the head while the head entry is executed or its scheduled
    /// frame has already passed. Returns how many entries were removed.
    ///
    /// The frame test handles orphaned keep-alives left behind by a
    /// departed peer, which are never marked executed.
    pub fn clean(&mut self, current: Frame) -> usize {
        let mut removed = 0;
        while let Some(head) = self.events.front() {
            if head.executed || head.frame < current {
                self.events.pop_front();
                removed += 1;
            } else {
                break;
            }
        }
        removed
    }
}

impl Default for DoList {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DO_LIST_CAPACITY)
    }
}

/// The per-machine staging FIFO of locally generated commands awaiting
/// transmission and local scheduling.
///
/// Entries are command data only; the origin and scheduled frame are
/// stamped at packet-build time, never earlier, so a dynamically raised
/// look-ahead can never cause an already-staged command to be scheduled in
/// the past.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    pending: VecDeque<EventData>,
    capacity: usize,
}

impl OutboundQueue {
    /// Creates an empty staging queue bounded to `capacity` commands.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        debug_assert!(capacity > 0);
        OutboundQueue {
            pending: VecDeque::new(),
            capacity,
        }
    }

    /// Number of staged commands.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is staged.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Stages a command for the next packet flush.
    ///
    /// # Errors
    ///
    /// [`LockstepError::OutboundFull`] when at capacity.
    pub fn push(&mut self, data: EventData) -> Result<(), LockstepError> {
        if self.pending.len() >= self.capacity {
            return Err(LockstepError::OutboundFull {
                capacity: self.capacity,
            });
        }
        self.pending.push_back(data);
        Ok(())
    }

    /// Removes and returns the oldest staged command.
    pub fn pop_front(&mut self) -> Option<EventData> {
        self.pending.pop_front()
    }

    /// Returns a staged command to the front of the queue (used when a
    /// packet ran out of room before including it).
    pub fn push_front(&mut self, data: EventData) {
        self.pending.push_front(data);
    }
}
