use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::command::Command;

struct Entry {
    priority_key: u64,
    seq: u64,
    command: Command,
}

struct QueueState {
    entries: Vec<Entry>,
    next_seq: u64,
    closed: bool,
}

/// Multi-producer, multi-consumer priority queue of Commands (§4.1). A
/// min-heap keyed on `totalExecTime` with insertion order as the tie-break,
/// exposing a non-standard `take(matcher)` that blocks until an element
/// satisfying the caller's predicate appears.
///
/// Liveness (L1) is satisfied conservatively: every insertion broadcasts to
/// *all* waiters rather than trying to wake only the one whose matcher would
/// accept the new element. This is simpler than a private condition per
/// waiter and still guarantees a matching element is never left unconsumed
/// while a matching waiter sleeps, at the cost of the occasional spurious
/// wakeup under heavy contention.
pub struct CommandQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: Vec::new(),
                next_seq: 0,
                closed: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Insert `command`, priced at its current `totalExecTime`.
    pub fn insert(&self, command: Command) {
        let mut state = self.state.lock().unwrap();
        let seq = state.next_seq;
        state.next_seq += 1;
        let priority_key = command.total_exec_time().as_millis() as u64;
        trace!(command_id = %command.id, priority_key, seq, "enqueueing command");
        state.entries.push(Entry {
            priority_key,
            seq,
            command,
        });
        // Conservative broadcast-on-insert (L1).
        self.cond.notify_all();
    }

    /// Block until an element for which `matcher` holds is the minimum
    /// matching element, then remove and return it. `None` on timeout or if
    /// the queue has been closed (graceful shutdown).
    pub fn take<F>(&self, matcher: F, timeout: Option<Duration>) -> Option<Command>
    where
        F: Fn(&Command) -> bool,
    {
        let start = Instant::now();
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(idx) = Self::find_min_match(&state.entries, &matcher) {
                let entry = state.entries.remove(idx);
                debug!(command_id = %entry.command.id, "dequeued command");
                return Some(entry.command);
            }

            if state.closed {
                return None;
            }

            state = match timeout {
                None => self.cond.wait(state).unwrap(),
                Some(total) => {
                    let elapsed = start.elapsed();
                    if elapsed >= total {
                        return None;
                    }
                    let (guard, result) =
                        self.cond.wait_timeout(state, total - elapsed).unwrap();
                    if result.timed_out() {
                        // One more look before giving up: the notifying
                        // insert and the timeout may race.
                        if let Some(idx) = Self::find_min_match(&guard.entries, &matcher) {
                            let mut guard = guard;
                            let entry = guard.entries.remove(idx);
                            return Some(entry.command);
                        }
                        return None;
                    }
                    guard
                }
            };
        }
    }

    fn find_min_match<F>(entries: &[Entry], matcher: &F) -> Option<usize>
    where
        F: Fn(&Command) -> bool,
    {
        entries
            .iter()
            .enumerate()
            .filter(|(_, e)| matcher(&e.command))
            .min_by_key(|(_, e)| (e.priority_key, e.seq))
            .map(|(idx, _)| idx)
    }

    /// Snapshot of currently queued Commands, in no particular order.
    pub fn list_queued(&self) -> Vec<Command> {
        let state = self.state.lock().unwrap();
        state.entries.iter().map(|e| e.command.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clear the queue and wake every waiter with "none" (graceful shutdown).
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap();
        state.closed = true;
        state.entries.clear();
        self.cond.notify_all();
    }
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new()
    }
}
