//! Distinct-state cell: a cold source coalesced into a latest-value slot.
//!
//! The producer overwrites the cell only when the new value differs from the
//! held one by structural equality, so readers observe the sequence of
//! changes and never an intermediate repeat. A reader slower than the
//! producer misses toggles (last-write-wins); a reader subscribed late
//! misses changes that happened before it arrived. There is no replay.

use std::sync::Arc;

use tracing::debug;

use crate::activation::Activation;
use crate::error::Result;
use crate::exec::Async;
use crate::monitor::Monitor;
use crate::source::{Source, Step};

struct Slot<T> {
    value: Option<T>,
    version: u64,
    stop: bool,
}

/// A hot cell holding the latest distinct value of a source.
pub struct StateFeed<T> {
    slot: Arc<Monitor<Slot<T>>>,
    activation: Arc<Activation>,
}

impl<T> Clone for StateFeed<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
            activation: Arc::clone(&self.activation),
        }
    }
}

impl<T> std::fmt::Debug for StateFeed<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateFeed").finish_non_exhaustive()
    }
}

pub(crate) fn state_in<T: Clone + PartialEq + Send + Sync + 'static>(
    exec: Arc<Async>,
    source: Arc<dyn Source<T>>,
    delay: bool,
) -> Result<StateFeed<T>> {
    exec.ensure_dedicated_producer("state_in")?;

    let slot = Arc::new(Monitor::new(Slot {
        value: None,
        version: 0,
        stop: false,
    }));

    let emit = {
        let slot = Arc::clone(&slot);
        move || {
            debug!("state feed producer started");
            source.drive(&mut |item| {
                let mut state = slot.lock();
                if state.value.as_ref() != Some(&item) {
                    state.value = Some(item);
                    state.version += 1;
                    slot.notify_all();
                }
                Step::Continue
            });
            let mut state = slot.lock();
            state.stop = true;
            slot.notify_all();
            debug!("state feed producer finished");
        }
    };

    let activation = Arc::new(Activation::new(exec, Box::new(emit)));
    if !delay {
        activation.ensure_started()?;
    }

    Ok(StateFeed { slot, activation })
}

impl<T: Clone + PartialEq + Send + Sync + 'static> StateFeed<T> {
    /// Deliver every change observed after subscription until the producer
    /// stops or the sink stops early. A change written just before the stop
    /// flag is still delivered.
    ///
    /// On a delayed feed, the first pull starts the producer.
    pub fn consume(&self, mut sink: impl FnMut(T) -> Step) -> Result<()> {
        self.activation.ensure_started()?;
        let mut last_seen = self.slot.lock().version;
        loop {
            let item = {
                let mut state = self.slot.lock();
                loop {
                    if state.version != last_seen {
                        if let Some(value) = state.value.clone() {
                            last_seen = state.version;
                            break value;
                        }
                    }
                    if state.stop {
                        return Ok(());
                    }
                    self.slot.wait(&mut state);
                }
            };
            if sink(item) == Step::Stop {
                return Ok(());
            }
        }
    }

    /// Snapshot of the current value, if any change has been admitted yet.
    pub fn latest(&self) -> Option<T> {
        self.slot.lock().value.clone()
    }

    /// Wait for the producer task, surfacing a panic from inside it.
    pub fn join(&self) -> Result<()> {
        self.activation.join()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::exec::delay;
    use crate::source;
    use std::time::Duration;

    fn paced<T: Clone + Send + Sync + 'static>(
        items: Vec<T>,
        pace: Duration,
    ) -> Arc<dyn Source<T>> {
        Arc::new(source::from_fn(move |sink: &mut dyn FnMut(T) -> Step| {
            for item in items.iter().cloned() {
                delay(pace);
                if sink(item) == Step::Stop {
                    return;
                }
            }
        }))
    }

    #[test]
    fn test_repeats_are_coalesced_into_changes() {
        let exec = Async::threads();
        let feed = state_in(
            exec,
            paced(vec![1, 1, 2, 2, 2, 3], Duration::from_millis(20)),
            true,
        )
        .unwrap();

        let mut changes = Vec::new();
        feed.consume(|v| {
            changes.push(v);
            Step::Continue
        })
        .unwrap();
        assert_eq!(changes, vec![1, 2, 3]);
    }

    #[test]
    fn test_fast_producer_still_delivers_final_value() {
        let exec = Async::threads();
        // First push is held back so the delayed reader is subscribed before
        // any change lands; after that the producer runs unpaced.
        let source = Arc::new(source::from_fn(|sink: &mut dyn FnMut(i32) -> Step| {
            delay(Duration::from_millis(30));
            for i in 0..1000 {
                if sink(i) == Step::Stop {
                    return;
                }
            }
        }));
        let feed = state_in(exec, source, true).unwrap();

        let mut seen = Vec::new();
        feed.consume(|v| {
            seen.push(v);
            Step::Continue
        })
        .unwrap();

        // Intermediate values may be coalesced away, but never reordered,
        // and the last change always arrives.
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*seen.last().unwrap(), 999);
    }

    #[test]
    fn test_late_reader_misses_earlier_changes() {
        let exec = Async::threads();
        let feed = state_in(exec, Arc::new(source::of(vec![1, 2, 3])), false).unwrap();
        feed.join().unwrap();

        let mut seen = Vec::new();
        feed.consume(|v: i32| {
            seen.push(v);
            Step::Continue
        })
        .unwrap();
        assert!(seen.is_empty());
        assert_eq!(feed.latest(), Some(3));
    }

    #[test]
    fn test_rejects_work_stealing_producers() {
        let fj = Async::fork_join_common();
        let err = state_in(fj, Arc::new(source::of(vec![1])), false).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
