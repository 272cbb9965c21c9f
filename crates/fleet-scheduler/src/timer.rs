use std::cmp::Ordering;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

struct TimerTask {
    when: Instant,
    seq: u64,
    task: Box<dyn FnOnce() + Send>,
}

impl PartialEq for TimerTask {
    fn eq(&self, other: &Self) -> bool {
        self.when == other.when && self.seq == other.seq
    }
}
impl Eq for TimerTask {}

impl PartialOrd for TimerTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerTask {
    // Reversed so `BinaryHeap` (a max-heap) pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .when
            .cmp(&self.when)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    tasks: std::collections::BinaryHeap<TimerTask>,
    next_seq: u64,
    cancelled: bool,
}

/// Single dedicated thread servicing deferred requeues (§4.1, §5): loop-mode
/// Commands with `minLoopTime > 0` are reinserted via a callback scheduled
/// here rather than immediately.
pub struct TimerService {
    state: Mutex<State>,
    cond: Condvar,
}

impl TimerService {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                tasks: std::collections::BinaryHeap::new(),
                next_seq: 0,
                cancelled: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Run `task` after `delay`. Uncancellable individually — the whole
    /// service is cancelled together on scheduler shutdown.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) {
        let mut state = self.state.lock().unwrap();
        if state.cancelled {
            return;
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.tasks.push(TimerTask {
            when: Instant::now() + delay,
            seq,
            task: Box::new(task),
        });
        self.cond.notify_all();
    }

    /// Run the service's dispatch loop. Intended to run on its own thread
    /// for the lifetime of the scheduler.
    pub fn run(&self) {
        loop {
            let mut state = self.state.lock().unwrap();
            if state.cancelled {
                return;
            }

            let next_deadline = state.tasks.peek().map(|t| t.when);
            let task = match next_deadline {
                None => {
                    state = self.cond.wait(state).unwrap();
                    if state.cancelled {
                        return;
                    }
                    None
                }
                Some(when) => {
                    let now = Instant::now();
                    if now >= when {
                        state.tasks.pop()
                    } else {
                        let (guard, _) = self.cond.wait_timeout(state, when - now).unwrap();
                        state = guard;
                        None
                    }
                }
            };
            drop(state);

            if let Some(t) = task {
                trace!(seq = t.seq, "firing timer task");
                (t.task)();
            }
        }
    }

    /// Cancel the timer: drop all pending tasks and wake the dispatch loop
    /// so it exits.
    pub fn cancel(&self) {
        debug!("cancelling timer service");
        let mut state = self.state.lock().unwrap();
        state.cancelled = true;
        state.tasks.clear();
        self.cond.notify_all();
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn schedules_and_fires_a_task() {
        let timer = Arc::new(TimerService::new());
        let t2 = timer.clone();
        let runner = thread::spawn(move || t2.run());

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        timer.schedule(Duration::from_millis(20), move || {
            fired2.store(true, AtomicOrdering::SeqCst);
        });

        thread::sleep(Duration::from_millis(80));
        assert!(fired.load(AtomicOrdering::SeqCst));

        timer.cancel();
        runner.join().unwrap();
    }

    #[test]
    fn cancel_drops_pending_tasks() {
        let timer = Arc::new(TimerService::new());
        let t2 = timer.clone();
        let runner = thread::spawn(move || t2.run());

        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();
        timer.schedule(Duration::from_millis(200), move || {
            fired2.store(true, AtomicOrdering::SeqCst);
        });
        timer.cancel();
        runner.join().unwrap();

        thread::sleep(Duration::from_millis(250));
        assert!(!fired.load(AtomicOrdering::SeqCst));
    }
}
