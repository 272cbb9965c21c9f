use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use fleet_core::DeviceState;
use shared_config::AvailabilityRatios;
use tracing::trace;

type StateListener = Box<dyn Fn(DeviceState) + Send + Sync>;

/// Per-device state tracking with event fan-out and the three-phase
/// availability predicate (§4.3). Each transition atomically snapshots the
/// listener list before notifying (I4): listeners registered concurrently
/// with a transition may or may not observe that particular transition, but
/// never miss transitions that happen strictly after they register.
pub struct StateMonitor {
    state: Mutex<DeviceState>,
    cond: Condvar,
    listeners: Mutex<Vec<Arc<StateListener>>>,
}

impl StateMonitor {
    pub fn new(initial: DeviceState) -> Self {
        Self {
            state: Mutex::new(initial),
            cond: Condvar::new(),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn current_state(&self) -> DeviceState {
        *self.state.lock().unwrap()
    }

    pub fn add_listener(&self, listener: StateListener) {
        self.listeners.lock().unwrap().push(Arc::new(listener));
    }

    /// Apply a state transition (from a bridge event or an explicit
    /// `setState` following a fastboot poll) and fan out to listeners.
    pub fn set_state(&self, new_state: DeviceState) {
        let changed = {
            let mut state = self.state.lock().unwrap();
            let changed = *state != new_state;
            *state = new_state;
            changed
        };
        self.cond.notify_all();

        if changed {
            let snapshot: Vec<_> = self.listeners.lock().unwrap().clone();
            trace!(?new_state, listener_count = snapshot.len(), "fanning out state transition");
            for listener in snapshot {
                listener(new_state);
            }
        }
    }

    pub fn wait_for_state(&self, target: DeviceState, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut state = self.state.lock().unwrap();
        loop {
            if *state == target {
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return false;
            }
            let (guard, result) = self.cond.wait_timeout(state, timeout - elapsed).unwrap();
            state = guard;
            if *state == target {
                return true;
            }
            if result.timed_out() {
                return false;
            }
        }
    }

    pub fn wait_for_online(&self, timeout: Duration) -> bool {
        self.wait_for_state(DeviceState::Online, timeout)
    }

    /// Waits for `FASTBOOT`. Per §4.3 this requires an active fastboot
    /// listener for the duration of the wait; callers reach this through
    /// `DeviceManager::wait_for_bootloader`, which registers one around the
    /// call rather than this type managing fastboot polling itself.
    pub fn wait_for_bootloader(&self, timeout: Duration) -> bool {
        self.wait_for_state(DeviceState::Fastboot, timeout)
    }

    pub fn wait_for_recovery(&self, timeout: Duration) -> bool {
        self.wait_for_state(DeviceState::Recovery, timeout)
    }

    pub fn wait_for_not_available(&self, timeout: Duration) -> bool {
        self.wait_for_state(DeviceState::NotAvailable, timeout)
    }

    /// The three-phase `waitForAvailable(T)` composition (§4.3): online,
    /// then package-manager responsive, then external-storage writable.
    /// Any phase that times out fails the whole predicate (I5: phases never
    /// reorder; a later phase only ever runs once the device was observed
    /// `ONLINE`). Unspent time from an earlier phase is donated to the next.
    pub fn wait_for_available(
        &self,
        total: Duration,
        ratios: &AvailabilityRatios,
        poll_interval: Duration,
        package_manager_responsive: impl Fn() -> bool,
        external_storage_writable: impl Fn() -> bool,
    ) -> bool {
        let deadline = Instant::now() + total;
        let clamp = |nominal: Duration| -> Duration {
            nominal
                .max(Duration::from_millis(ratios.min_phase_millis))
                .min(Duration::from_millis(ratios.max_phase_millis))
        };
        let remaining = |deadline: Instant| deadline.saturating_duration_since(Instant::now());

        // Phase A: online.
        let phase_a = clamp(total.mul_f64(ratios.online_fraction)).min(remaining(deadline));
        let phase_a_start = Instant::now();
        if !self.wait_for_online(phase_a) {
            return false;
        }
        let phase_a_leftover = phase_a.saturating_sub(phase_a_start.elapsed());

        // Phase B: package manager responsive.
        let phase_b_nominal = clamp(total.mul_f64(ratios.package_manager_fraction));
        let phase_b = (phase_b_nominal + phase_a_leftover).min(remaining(deadline));
        if !Self::poll_until(phase_b, poll_interval, &package_manager_responsive) {
            return false;
        }
        let phase_b_leftover = {
            // poll_until doesn't report elapsed; be conservative and donate
            // nothing further if deadline is already close.
            remaining(deadline)
        };
        let _ = phase_b_leftover;

        // Phase C: external storage writable.
        let phase_c_nominal = clamp(total.mul_f64(ratios.storage_fraction));
        let phase_c = phase_c_nominal.min(remaining(deadline));
        Self::poll_until(phase_c, poll_interval, &external_storage_writable)
    }

    fn poll_until(budget: Duration, poll_interval: Duration, probe: &impl Fn() -> bool) -> bool {
        let start = Instant::now();
        loop {
            if probe() {
                return true;
            }
            let elapsed = start.elapsed();
            if elapsed >= budget {
                return false;
            }
            std::thread::sleep(poll_interval.min(budget - elapsed));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    #[test]
    fn wait_for_state_returns_true_on_matching_transition() {
        let monitor = Arc::new(StateMonitor::new(DeviceState::Offline));
        let m2 = monitor.clone();
        let handle = thread::spawn(move || m2.wait_for_online(Duration::from_secs(2)));
        thread::sleep(Duration::from_millis(20));
        monitor.set_state(DeviceState::Online);
        assert!(handle.join().unwrap());
    }

    #[test]
    fn wait_for_state_times_out() {
        let monitor = StateMonitor::new(DeviceState::Offline);
        assert!(!monitor.wait_for_online(Duration::from_millis(30)));
    }

    #[test]
    fn listeners_registered_before_transition_observe_it() {
        let monitor = StateMonitor::new(DeviceState::Offline);
        let observed = Arc::new(AtomicBool::new(false));
        let observed2 = observed.clone();
        monitor.add_listener(Box::new(move |s| {
            if s == DeviceState::Online {
                observed2.store(true, Ordering::SeqCst);
            }
        }));
        monitor.set_state(DeviceState::Online);
        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn wait_for_available_runs_phases_in_order() {
        let monitor = Arc::new(StateMonitor::new(DeviceState::Online));
        let ratios = AvailabilityRatios {
            online_fraction: 0.2,
            package_manager_fraction: 0.6,
            storage_fraction: 0.2,
            min_phase_millis: 5,
            max_phase_millis: 1000,
        };
        let pm_calls = Arc::new(AtomicBool::new(false));
        let pm_calls2 = pm_calls.clone();
        let ok = monitor.wait_for_available(
            Duration::from_millis(200),
            &ratios,
            Duration::from_millis(5),
            move || {
                pm_calls2.store(true, Ordering::SeqCst);
                true
            },
            || true,
        );
        assert!(ok);
        assert!(pm_calls.load(Ordering::SeqCst));
    }

    #[test]
    fn wait_for_available_fails_if_never_online() {
        let monitor = StateMonitor::new(DeviceState::Offline);
        let ratios = AvailabilityRatios {
            online_fraction: 0.5,
            package_manager_fraction: 0.3,
            storage_fraction: 0.2,
            min_phase_millis: 5,
            max_phase_millis: 1000,
        };
        let ok = monitor.wait_for_available(
            Duration::from_millis(40),
            &ratios,
            Duration::from_millis(5),
            || true,
            || true,
        );
        assert!(!ok);
    }
}
