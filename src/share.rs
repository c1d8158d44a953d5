//! Ring-buffer multicast: one background producer, many independent readers.
//!
//! A cold source becomes a hot feed through a fixed-capacity circular buffer.
//! Each reader owns a private 64-bit logical cursor measured against a
//! monotonic eviction counter; a reader that falls behind is snapped forward
//! to the oldest live element. Backpressure is by eviction: a slow reader
//! skips stale data, it never blocks the producer and the buffer never
//! grows. Data loss is visible through the cursor, not silent corruption.

use std::sync::Arc;

use tracing::debug;

use crate::activation::Activation;
use crate::error::{Error, Result};
use crate::exec::Async;
use crate::monitor::Monitor;
use crate::source::{Reducer, Source, Step};

struct Ring<T> {
    slots: Vec<T>,
    head: usize,
    dropped: u64,
    stop: bool,
}

/// A hot, shared feed over a bounded circular buffer.
///
/// Clones share the producer and buffer; every `consume` call is an
/// independent reader with its own cursor, starting at the oldest element
/// still live at subscription time.
pub struct SharedFeed<T> {
    ring: Arc<Monitor<Ring<T>>>,
    activation: Arc<Activation>,
    capacity: usize,
}

impl<T> Clone for SharedFeed<T> {
    fn clone(&self) -> Self {
        Self {
            ring: Arc::clone(&self.ring),
            activation: Arc::clone(&self.activation),
            capacity: self.capacity,
        }
    }
}

impl<T> std::fmt::Debug for SharedFeed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedFeed")
            .field("capacity", &self.capacity)
            .finish()
    }
}

pub(crate) fn share_in<T: Clone + Send + Sync + 'static>(
    exec: Arc<Async>,
    source: Arc<dyn Source<T>>,
    capacity: usize,
    delay: bool,
) -> Result<SharedFeed<T>> {
    exec.ensure_dedicated_producer("share_in")?;
    if capacity == 0 {
        return Err(Error::Configuration(
            "share_in requires a positive buffer capacity".to_string(),
        ));
    }

    let ring = Arc::new(Monitor::new(Ring {
        slots: Vec::with_capacity(capacity),
        head: 0,
        dropped: 0,
        stop: false,
    }));

    let emit = {
        let ring = Arc::clone(&ring);
        move || {
            debug!(capacity, "shared feed producer started");
            source.drive(&mut |item| {
                let mut state = ring.lock();
                if state.slots.len() < capacity {
                    state.slots.push(item);
                } else {
                    let head = state.head;
                    state.slots[head] = item;
                    state.head = (head + 1) % capacity;
                    state.dropped += 1;
                }
                ring.notify_all();
                Step::Continue
            });
            let mut state = ring.lock();
            state.stop = true;
            ring.notify_all();
            debug!("shared feed producer finished");
        }
    };

    let activation = Arc::new(Activation::new(exec, Box::new(emit)));
    if !delay {
        activation.ensure_started()?;
    }

    Ok(SharedFeed {
        ring,
        activation,
        capacity,
    })
}

impl<T: Clone + Send + Sync + 'static> SharedFeed<T> {
    /// Read the feed on the calling thread until the producer has stopped
    /// and everything live has been delivered, or the sink stops early.
    ///
    /// On a delayed feed, the first pull starts the producer.
    pub fn consume(&self, mut sink: impl FnMut(T) -> Step) -> Result<()> {
        self.activation.ensure_started()?;
        let mut cursor = self.ring.lock().dropped;
        loop {
            let item = {
                let mut state = self.ring.lock();
                loop {
                    if cursor < state.dropped {
                        // Fell behind: the slots at [cursor, dropped) are
                        // gone. Fast-forward to the oldest live element.
                        cursor = state.dropped;
                    }
                    let live = state.slots.len() as u64;
                    if cursor - state.dropped < live {
                        let offset = (cursor - state.dropped) as usize;
                        let index = (state.head + offset) % self.capacity;
                        break state.slots[index].clone();
                    }
                    if state.stop {
                        return Ok(());
                    }
                    self.ring.wait(&mut state);
                }
            };
            cursor += 1;
            if sink(item) == Step::Stop {
                return Ok(());
            }
        }
    }

    /// Drain the feed into a reducer and return the finished accumulation.
    pub fn reduce<R: Reducer<T>>(&self, reducer: R) -> Result<R::Out> {
        let mut acc = reducer.supply();
        self.consume(|item| {
            reducer.accumulate(&mut acc, item);
            Step::Continue
        })?;
        Ok(reducer.finish(acc))
    }

    /// Wait for the producer task, surfacing a panic from inside it.
    pub fn join(&self) -> Result<()> {
        self.activation.join()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
