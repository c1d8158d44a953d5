//! Lifecycle wrapper that turns a cold source into a background consumption.
//!
//! `Unconsumed -> Running -> {Completed, Cancelled}`. The task-handle slot
//! is single-assignment: consuming twice is a usage error, not a silent
//! restart. Cancellation is cooperative, checked at each iteration boundary
//! of the producer loop, but synchronous for the caller: `cancel` joins the
//! background task before returning.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::channel::HotChannel;
use crate::error::{Error, Result};
use crate::exec::{Async, TaskSlot};
use crate::share::{self, SharedFeed};
use crate::source::{Reducer, Source, Step};
use crate::state::{self, StateFeed};

type Hook = Box<dyn FnOnce() + Send + 'static>;

/// How elements reach the sink.
enum Mode {
    /// The sink runs inline on the producer thread; `consume` returns as
    /// soon as the task is submitted.
    Direct,
    /// The producer feeds a [`HotChannel`] and the caller drains it in the
    /// foreground; `consume` blocks until the source is exhausted.
    Channelled,
}

/// An async-wrapped sequence: an immutable source bound to an execution
/// strategy, with a single-assignment task slot and a cancellation flag.
pub struct AsyncSeq<T: Send + 'static> {
    exec: Arc<Async>,
    source: Arc<dyn Source<T>>,
    mode: Mode,
    on_start: Mutex<Vec<Hook>>,
    on_completion: Mutex<Vec<Hook>>,
    consumed: AtomicBool,
    cancelled: Arc<AtomicBool>,
    task: Arc<TaskSlot>,
}

impl Async {
    /// Wrap a cold source for background consumption; the sink will run on
    /// the producer thread.
    pub fn wrap<T: Send + 'static>(
        self: &Arc<Self>,
        source: impl Source<T> + 'static,
    ) -> AsyncSeq<T> {
        AsyncSeq::new(Arc::clone(self), Arc::new(source), Mode::Direct)
    }

    /// Wrap a cold source behind a hand-off channel; the sink will run on
    /// the consuming thread and `consume` will block until exhaustion.
    pub fn through_channel<T: Send + 'static>(
        self: &Arc<Self>,
        source: impl Source<T> + 'static,
    ) -> AsyncSeq<T> {
        AsyncSeq::new(Arc::clone(self), Arc::new(source), Mode::Channelled)
    }
}

impl<T: Send + 'static> AsyncSeq<T> {
    fn new(exec: Arc<Async>, source: Arc<dyn Source<T>>, mode: Mode) -> Self {
        Self {
            exec,
            source,
            mode,
            on_start: Mutex::new(Vec::new()),
            on_completion: Mutex::new(Vec::new()),
            consumed: AtomicBool::new(false),
            cancelled: Arc::new(AtomicBool::new(false)),
            task: Arc::new(TaskSlot::empty()),
        }
    }

    /// Start consuming. Start hooks run on the caller first; the background
    /// task then drives the source into the sink, checking the cancellation
    /// flag before each element.
    ///
    /// Fails with [`Error::AlreadyConsumed`] on a second call.
    pub fn consume(&self, mut sink: impl FnMut(T) + Send + 'static) -> Result<()> {
        self.reserve()?;
        self.run_start_hooks();
        let source = Arc::clone(&self.source);
        let cancelled = Arc::clone(&self.cancelled);
        let completion = self.take_completion_hooks();
        match self.mode {
            Mode::Direct => {
                let handle = self.exec.submit(move || {
                    source.drive(&mut |item| {
                        if cancelled.load(Ordering::Acquire) {
                            return Step::Stop;
                        }
                        sink(item);
                        Step::Continue
                    });
                    for hook in completion {
                        hook();
                    }
                })?;
                self.task.put(handle);
                trace!("async consumption submitted");
                Ok(())
            }
            Mode::Channelled => {
                let channel = Arc::new(HotChannel::new());
                let producer = Arc::clone(&channel);
                let handle = self.exec.submit(move || {
                    source.drive(&mut |item| {
                        if cancelled.load(Ordering::Acquire) {
                            return Step::Stop;
                        }
                        producer.push(item);
                        Step::Continue
                    });
                    producer.close();
                })?;
                self.task.put(handle);
                channel.drain(&mut |item| sink(item));
                for hook in completion {
                    hook();
                }
                Ok(())
            }
        }
    }

    /// Consume through the hand-off channel into a reducer, returning the
    /// finished accumulation once the source is exhausted.
    pub fn reduce<R: Reducer<T>>(&self, reducer: R) -> Result<R::Out> {
        self.reserve()?;
        self.run_start_hooks();
        let source = Arc::clone(&self.source);
        let cancelled = Arc::clone(&self.cancelled);
        let completion = self.take_completion_hooks();
        let channel = Arc::new(HotChannel::new());
        let producer = Arc::clone(&channel);
        let handle = self.exec.submit(move || {
            source.drive(&mut |item| {
                if cancelled.load(Ordering::Acquire) {
                    return Step::Stop;
                }
                producer.push(item);
                Step::Continue
            });
            producer.close();
        })?;
        self.task.put(handle);
        let mut acc = reducer.supply();
        channel.drain(&mut |item| reducer.accumulate(&mut acc, item));
        for hook in completion {
            hook();
        }
        Ok(reducer.finish(acc))
    }

    /// Set the cancellation flag, then join the background task. Returns
    /// once the producer has observed the flag at an iteration boundary and
    /// exited; work in flight for the current element completes.
    pub fn cancel(&self) -> Result<()> {
        self.cancelled.store(true, Ordering::Release);
        self.join_consume()
    }

    /// Join the background task if consumption was started, surfacing a
    /// panic from inside it.
    pub fn join_consume(&self) -> Result<()> {
        self.task.join()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Run a hook on the consuming caller immediately before the wrapped
    /// work starts. Same lifecycle, same task slot.
    pub fn on_start(self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_start.lock().push(Box::new(hook));
        self
    }

    /// Run a hook immediately after the wrapped work: after the producer
    /// loop for direct mode, after the foreground drain for channelled mode.
    pub fn on_completion(self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_completion.lock().push(Box::new(hook));
        self
    }

    /// Transform elements inline on the producer thread. The transformation
    /// must not block: it runs inside the producer loop.
    pub fn map<E: Send + 'static>(
        self,
        f: impl Fn(T) -> E + Send + Sync + 'static,
    ) -> AsyncSeq<E> {
        AsyncSeq {
            exec: self.exec,
            source: Arc::new(MappedSource {
                inner: self.source,
                f,
                _marker: PhantomData,
            }),
            mode: self.mode,
            on_start: Mutex::new(self.on_start.into_inner()),
            on_completion: Mutex::new(self.on_completion.into_inner()),
            consumed: AtomicBool::new(self.consumed.load(Ordering::Acquire)),
            cancelled: self.cancelled,
            task: self.task,
        }
    }

    fn reserve(&self) -> Result<()> {
        if self.consumed.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyConsumed);
        }
        Ok(())
    }

    fn run_start_hooks(&self) {
        for hook in self.on_start.lock().drain(..) {
            hook();
        }
    }

    fn take_completion_hooks(&self) -> Vec<Hook> {
        self.on_completion.lock().drain(..).collect()
    }
}

impl<T: Clone + Send + Sync + 'static> AsyncSeq<T> {
    /// Share this wrapper's source as a bounded hot feed on its strategy.
    /// Independent of the single-consumption slot: the feed has its own
    /// producer task.
    pub fn share_in(&self, capacity: usize, delay: bool) -> Result<SharedFeed<T>> {
        share::share_in(
            Arc::clone(&self.exec),
            Arc::clone(&self.source),
            capacity,
            delay,
        )
    }
}

impl<T: Clone + PartialEq + Send + Sync + 'static> AsyncSeq<T> {
    /// Share this wrapper's source as a distinct-state cell on its strategy.
    pub fn state_in(&self, delay: bool) -> Result<StateFeed<T>> {
        state::state_in(Arc::clone(&self.exec), Arc::clone(&self.source), delay)
    }
}

struct MappedSource<T: 'static, E, F> {
    inner: Arc<dyn Source<T>>,
    f: F,
    _marker: PhantomData<fn(T) -> E>,
}

impl<T: 'static, E, F> Source<E> for MappedSource<T, E, F>
where
    F: Fn(T) -> E + Send + Sync,
{
    fn drive(&self, sink: &mut dyn FnMut(E) -> Step) {
        self.inner.drive(&mut |item| sink((self.f)(item)));
    }
}
