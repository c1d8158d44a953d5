//! Mutex + condvar monitor shared by the hand-off structures.
//!
//! All producer/consumer coordination in this crate follows the same
//! protocol: the writer mutates state and signals while holding the lock,
//! the reader drains everything available before blocking and re-checks its
//! wake condition after every wait. Keeping state and condvar in one place
//! makes it impossible to signal a condition the state does not yet show.

use parking_lot::{Condvar, Mutex, MutexGuard};

pub(crate) struct Monitor<S> {
    state: Mutex<S>,
    signal: Condvar,
}

impl<S> Monitor<S> {
    pub fn new(state: S) -> Self {
        Self {
            state: Mutex::new(state),
            signal: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock()
    }

    /// Block until signaled. The lock is released while waiting and
    /// re-acquired before returning; callers must re-check their condition.
    pub fn wait(&self, guard: &mut MutexGuard<'_, S>) {
        self.signal.wait(guard);
    }

    pub fn notify_one(&self) {
        self.signal.notify_one();
    }

    pub fn notify_all(&self) {
        self.signal.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_wait_wakes_on_notify() {
        let monitor = Arc::new(Monitor::new(false));
        let waiter = {
            let monitor = Arc::clone(&monitor);
            thread::spawn(move || {
                let mut ready = monitor.lock();
                while !*ready {
                    monitor.wait(&mut ready);
                }
            })
        };

        thread::sleep(Duration::from_millis(20));
        *monitor.lock() = true;
        monitor.notify_all();
        waiter.join().unwrap();
    }
}
