//! Cooperative scheduling primitives: the FIFO task queue, the per-connection
//! read back-off estimator and the clock it measures against.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// FIFO of pending work. The run loop pops one task, runs it, and pushes
/// whatever continuation it returns.
#[derive(Debug)]
pub struct TaskQueue<T> {
    tasks: VecDeque<T>,
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self { tasks: VecDeque::new() }
    }
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: T) {
        self.tasks.push_back(task);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.tasks.pop_front()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.tasks.iter()
    }
}

/// Next block duration given the time since the previous read attempt.
///
/// Over the target the connection is being serviced slowly, so halve (floor)
/// the block; otherwise grow it by `step`.
pub fn next_block_time(current_ms: u64, elapsed_ms: u64, target_ms: u64, step_ms: u64) -> u64 {
    if elapsed_ms > target_ms {
        current_ms / 2
    } else {
        current_ms.saturating_add(step_ms)
    }
}

/// Per-connection read timing state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadTiming {
    last_read_ms: Option<u64>,
    block_ms: u64,
}

impl ReadTiming {
    /// Record a read attempt at `now_ms` and return how long to block.
    /// The first attempt counts as zero elapsed time.
    pub fn update(&mut self, now_ms: u64, target_ms: u64, step_ms: u64) -> u64 {
        let last = *self.last_read_ms.get_or_insert(now_ms);
        let elapsed = now_ms.saturating_sub(last);
        self.block_ms = next_block_time(self.block_ms, elapsed, target_ms, step_ms);
        self.last_read_ms = Some(now_ms);
        self.block_ms
    }

    pub fn block_ms(&self) -> u64 {
        self.block_ms
    }
}

/// Time source for the scheduler; swapped for a manual clock in tests.
pub trait Clock {
    /// Monotonic milliseconds since an arbitrary origin.
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
}

pub struct SystemClock {
    origin: Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn sleep_ms(&self, ms: u64) {
        if ms > 0 {
            std::thread::sleep(Duration::from_millis(ms));
        }
    }
}

#[derive(Default)]
struct ManualState {
    now_ms: u64,
    sleeps: Vec<u64>,
}

/// Clock that only moves when told to. Sleeping advances it instantly and is
/// recorded, so tests can assert on the back-off sequence.
#[derive(Clone, Default)]
pub struct ManualClock {
    state: Arc<Mutex<ManualState>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.state.lock().now_ms += ms;
    }

    pub fn sleeps(&self) -> Vec<u64> {
        self.state.lock().sleeps.clone()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.state.lock().now_ms
    }

    fn sleep_ms(&self, ms: u64) {
        let mut state = self.state.lock();
        state.now_ms += ms;
        state.sleeps.push(ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_is_fifo() {
        let mut q = TaskQueue::new();
        q.push(1);
        q.push(2);
        q.push(3);
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(1));
        q.push(4);
        assert_eq!(q.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(4));
        assert!(q.is_empty());
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_backoff_follows_trace() {
        let trace = [0u64, 10, 600, 20, 501, 500, 1_000, 1_000, 1_000, 3];
        let mut block = 0u64;
        for elapsed in trace {
            let next = next_block_time(block, elapsed, 500, 10);
            if elapsed > 500 {
                assert_eq!(next, block / 2);
                assert!(next < block || block == 0);
            } else {
                assert_eq!(next, block + 10);
            }
            block = next;
        }
        assert_eq!(block, 12);
    }

    #[test]
    fn test_backoff_halves_to_zero() {
        let mut block = 77;
        for _ in 0..10 {
            block = next_block_time(block, 10_000, 500, 10);
        }
        assert_eq!(block, 0);
        assert_eq!(next_block_time(u64::MAX, 0, 500, 10), u64::MAX);
    }

    #[test]
    fn test_read_timing_uses_clock_intervals() {
        let clock = ManualClock::new();
        let mut timing = ReadTiming::default();

        // First read: zero elapsed, grows
        assert_eq!(timing.update(clock.now_ms(), 500, 10), 10);
        clock.sleep_ms(10);
        assert_eq!(timing.update(clock.now_ms(), 500, 10), 20);
        clock.advance(2_000);
        assert_eq!(timing.update(clock.now_ms(), 500, 10), 10);
        assert_eq!(timing.block_ms(), 10);
        assert_eq!(clock.sleeps(), vec![10]);
    }
}
