//! Point-to-point hand-off between one background producer and one
//! foreground reader.
//!
//! An unbounded FIFO queue behind a monitor. The reader drains everything
//! queued before it ever blocks, and re-checks the stop flag before each
//! wait, so a signal can never be lost between drain and sleep. This is not
//! a multicast: a second concurrent reader is outside the contract (shared
//! feeds are the multicast structure).

use std::collections::VecDeque;

use crate::monitor::Monitor;

struct ChannelState<T> {
    queue: VecDeque<T>,
    stop: bool,
}

pub struct HotChannel<T> {
    monitor: Monitor<ChannelState<T>>,
}

impl<T> Default for HotChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HotChannel<T> {
    pub fn new() -> Self {
        Self {
            monitor: Monitor::new(ChannelState {
                queue: VecDeque::new(),
                stop: false,
            }),
        }
    }

    /// Producer side: enqueue and signal the reader.
    pub fn push(&self, item: T) {
        let mut state = self.monitor.lock();
        state.queue.push_back(item);
        self.monitor.notify_one();
    }

    /// Producer side: mark the channel finished and signal one last time.
    /// Elements still queued stay readable.
    pub fn close(&self) {
        let mut state = self.monitor.lock();
        state.stop = true;
        self.monitor.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.monitor.lock().stop
    }

    /// Reader side: deliver every element to `sink` until the channel is
    /// closed and fully drained. Batches are taken out of the lock before
    /// the sink runs, so a slow sink never blocks the producer.
    pub fn drain(&self, sink: &mut dyn FnMut(T)) {
        loop {
            let batch = {
                let mut state = self.monitor.lock();
                loop {
                    if !state.queue.is_empty() {
                        break std::mem::take(&mut state.queue);
                    }
                    if state.stop {
                        return;
                    }
                    self.monitor.wait(&mut state);
                }
            };
            for item in batch {
                sink(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_hand_off_preserves_order_and_loses_nothing() {
        let channel = Arc::new(HotChannel::new());
        let producer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                for i in 0..1000 {
                    channel.push(i);
                }
                channel.close();
            })
        };

        let mut seen = Vec::new();
        channel.drain(&mut |i| seen.push(i));
        producer.join().unwrap();

        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_reader_drains_remaining_elements_after_close() {
        let channel = HotChannel::new();
        channel.push('a');
        channel.push('b');
        channel.close();

        let mut seen = Vec::new();
        channel.drain(&mut |c| seen.push(c));
        assert_eq!(seen, vec!['a', 'b']);
    }

    #[test]
    fn test_reader_blocks_until_signal() {
        let channel = Arc::new(HotChannel::new());
        let producer = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                channel.push(42);
                channel.close();
            })
        };

        let mut seen = Vec::new();
        channel.drain(&mut |i| seen.push(i));
        producer.join().unwrap();
        assert_eq!(seen, vec![42]);
    }
}
