//! Fixed-capacity FIFO shared by submitting threads and the delivery worker

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::envelope::{Command, CompletionSignal, Envelope};

#[derive(Default)]
struct QueueState {
    items: VecDeque<Envelope>,
    closed: bool,
    /// Queued control envelopes that disable retries ahead of them
    reconnect_barriers: usize,
    /// Gates of discarded synchronous envelopes, never signaled
    parked: Vec<CompletionSignal>,
}

/// Why a metric envelope was not queued; the envelope is handed back
#[derive(Debug)]
pub(crate) enum Rejected {
    Full(Envelope),
    Closed(Envelope),
}

/// Bounded envelope queue
///
/// Many producers, one consumer. Metric envelopes are rejected once the
/// queue holds `capacity` entries; existing entries are never evicted.
/// Closing the queue discards its contents and wakes the consumer.
/// Synchronous callers of discarded envelopes stay blocked for as long as
/// the queue lives.
pub(crate) struct BoundedQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl BoundedQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(QueueState::default()),
            changed: Condvar::new(),
        }
    }

    /// Append unless closed or full
    pub(crate) fn push(&self, envelope: Envelope) -> Result<(), Rejected> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Rejected::Closed(envelope));
        }
        if state.items.len() >= self.capacity {
            return Err(Rejected::Full(envelope));
        }
        Self::append(&mut state, envelope);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    /// Append a control envelope, ignoring capacity
    pub(crate) fn push_control(&self, envelope: Envelope) -> Result<(), Envelope> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(envelope);
        }
        Self::append(&mut state, envelope);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    /// Put an envelope back at the head so it is the next one popped
    pub(crate) fn push_front(&self, envelope: Envelope) -> Result<(), Envelope> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(envelope);
        }
        if envelope.suppresses_reconnect() {
            state.reconnect_barriers += 1;
        }
        state.items.push_front(envelope);
        drop(state);
        self.changed.notify_all();
        Ok(())
    }

    fn append(state: &mut QueueState, envelope: Envelope) {
        if envelope.suppresses_reconnect() {
            state.reconnect_barriers += 1;
        }
        state.items.push_back(envelope);
    }

    /// Block until an envelope is available; `None` once closed.
    ///
    /// Taking an `exit` envelope closes the queue to producers. Whatever is
    /// still queued behind it is left for `close` to discard.
    pub(crate) fn pop(&self) -> Option<Envelope> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return None;
            }
            if let Some(envelope) = state.items.pop_front() {
                if envelope.suppresses_reconnect() {
                    state.reconnect_barriers -= 1;
                }
                if matches!(envelope.command, Command::Exit) {
                    // The worker is leaving; later pushes must start a new one.
                    state.closed = true;
                }
                return Some(envelope);
            }
            self.changed.wait(&mut state);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// True while a `flush(false)` or shutdown `exit` is waiting
    pub(crate) fn reconnect_suppressed(&self) -> bool {
        self.state.lock().reconnect_barriers > 0
    }

    /// Close the queue, discarding everything still in it.
    ///
    /// Returns how many metric envelopes were discarded. Their completion
    /// gates are parked rather than dropped.
    pub(crate) fn close(&self) -> usize {
        let discarded = {
            let mut state = self.state.lock();
            state.closed = true;
            state.reconnect_barriers = 0;
            let mut items = std::mem::take(&mut state.items);
            state
                .parked
                .extend(items.iter_mut().filter_map(Envelope::take_completion));
            items
        };
        self.changed.notify_all();
        discarded.iter().filter(|e| !e.is_control()).count()
    }

    /// Discard an envelope taken off the queue, parking its gate
    pub(crate) fn park(&self, mut envelope: Envelope) {
        if let Some(signal) = envelope.take_completion() {
            self.state.lock().parked.push(signal);
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Sleep for `timeout` unless the queue is closed first.
    ///
    /// Returns true if the queue was (or became) closed.
    pub(crate) fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.closed {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.closed
    }
}
