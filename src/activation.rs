//! Start-once activation for shared feeds.
//!
//! A feed's producer task starts either eagerly at construction or lazily on
//! the first reader's first pull. The once-guard is owned by the feed, so
//! racing first readers agree on a single submission: one of them runs the
//! submit, the rest block on the guard and then observe it started.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::exec::{Async, TaskSlot, Work};

pub(crate) struct Activation {
    exec: Arc<Async>,
    started: OnceCell<()>,
    emit: Mutex<Option<Work>>,
    task: TaskSlot,
}

impl Activation {
    pub fn new(exec: Arc<Async>, emit: Work) -> Self {
        Self {
            exec,
            started: OnceCell::new(),
            emit: Mutex::new(Some(emit)),
            task: TaskSlot::empty(),
        }
    }

    /// Submit the producer if it has not been submitted yet.
    pub fn ensure_started(&self) -> Result<()> {
        self.started
            .get_or_try_init(|| {
                let mut slot = self.emit.lock();
                let emit = slot.take().ok_or(Error::Shutdown)?;
                let handle = self.exec.submit_boxed(emit)?;
                self.task.put(handle);
                Ok(())
            })
            .map(|_| ())
    }

    /// Wait for the producer task, surfacing a captured panic. No-op if the
    /// producer was never started or was already joined.
    pub fn join(&self) -> Result<()> {
        self.task.join()
    }
}
