use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use fleet_core::{
    Allocation, BridgeEvent, BridgeEventListener, DebugBridge, Device, DeviceSelection,
    DeviceState, Disposition, FastbootTransport, TimeoutSemaphore,
};
use tracing::{debug, info, instrument, warn};

use crate::device_operation::RecoveryContext;
use crate::recovery_policy::RecoveryPolicy;
use crate::state_monitor::StateMonitor;
use std::collections::HashSet;

struct Inner {
    devices: HashMap<String, Device>,
    monitors: HashMap<String, Arc<StateMonitor>>,
    fastboot_locks: HashMap<String, Arc<TimeoutSemaphore>>,
    /// Serials quarantined via `free(.., Unresponsive)`, pending release on
    /// the next bridge state-change for that device (§4.2 disposition
    /// table: "unresponsive" is quarantined only until the next observed
    /// state, unlike a `force_allocate` filter quarantine, which is only
    /// lifted explicitly via `release_filter`).
    unresponsive_quarantine: HashSet<String>,
    terminated: bool,
}

/// Owns the set of known devices and the free/allocated partition (§4.2).
pub struct DeviceManager {
    bridge: Arc<dyn DebugBridge>,
    fastboot: Arc<dyn FastbootTransport>,
    inner: Mutex<Inner>,
    cond: Condvar,
    global_filter: Mutex<Option<DeviceSelection>>,
    fastboot_listener_count: AtomicUsize,
    fastboot_polling: Arc<std::sync::atomic::AtomicBool>,
    fastboot_poll_interval: Duration,
}

struct BridgeForwarder {
    manager: Weak<DeviceManager>,
}

impl BridgeEventListener for BridgeForwarder {
    fn on_event(&self, event: BridgeEvent) {
        if let Some(manager) = self.manager.upgrade() {
            manager.handle_bridge_event(event);
        }
    }
}

impl DeviceManager {
    pub fn new(
        bridge: Arc<dyn DebugBridge>,
        fastboot: Arc<dyn FastbootTransport>,
        fastboot_poll_interval: Duration,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|weak| {
            let manager = DeviceManager {
                bridge: bridge.clone(),
                fastboot,
                inner: Mutex::new(Inner {
                    devices: HashMap::new(),
                    monitors: HashMap::new(),
                    fastboot_locks: HashMap::new(),
                    unresponsive_quarantine: HashSet::new(),
                    terminated: false,
                }),
                cond: Condvar::new(),
                global_filter: Mutex::new(None),
                fastboot_listener_count: AtomicUsize::new(0),
                fastboot_polling: Arc::new(std::sync::atomic::AtomicBool::new(false)),
                fastboot_poll_interval,
            };
            bridge.subscribe(Box::new(BridgeForwarder {
                manager: weak.clone(),
            }));
            manager
        });

        // `subscribe` only guarantees future connect/disconnect callbacks; a
        // bridge's already-visible devices at construction time must be
        // pulled explicitly since the `Weak` handed to the subscription
        // can't upgrade until this `Arc` finishes constructing.
        if let Ok(existing) = manager.bridge.list_devices() {
            let mut inner = manager.inner.lock().unwrap();
            for (serial, state) in existing {
                manager.ensure_device_locked(&mut inner, &serial, state);
            }
            drop(inner);
            manager.cond.notify_all();
        }

        manager
    }

    pub fn set_global_filter(&self, selection: Option<DeviceSelection>) {
        *self.global_filter.lock().unwrap() = selection;
    }

    pub fn monitor_for(&self, serial: &str) -> Option<Arc<StateMonitor>> {
        self.inner.lock().unwrap().monitors.get(serial).cloned()
    }

    /// A point-in-time copy of the known `Device`, for matching a Command's
    /// selection against a specific serial without holding the manager lock.
    pub fn device_snapshot(&self, serial: &str) -> Option<Device> {
        self.inner.lock().unwrap().devices.get(serial).cloned()
    }

    pub fn fastboot_lock_for(&self, serial: &str) -> Option<Arc<TimeoutSemaphore>> {
        self.inner.lock().unwrap().fastboot_locks.get(serial).cloned()
    }

    /// Build a `RecoveryContext` for `serial` against the currently known
    /// device, monitor, and fastboot lock, wiring in `policy` and this
    /// manager's bridge (§4.4). Returns `None` for a serial the manager has
    /// never seen.
    pub fn recovery_context(
        &self,
        serial: &str,
        policy: Arc<dyn RecoveryPolicy>,
    ) -> Option<RecoveryContext> {
        let inner = self.inner.lock().unwrap();
        let device = inner.devices.get(serial)?.clone();
        let monitor = inner.monitors.get(serial)?.clone();
        let fastboot_lock = inner.fastboot_locks.get(serial)?.clone();
        drop(inner);
        Some(RecoveryContext::new(
            serial,
            monitor,
            policy,
            device.recovery_policy,
            fastboot_lock,
            self.bridge.clone(),
        ))
    }

    #[instrument(skip(self))]
    fn handle_bridge_event(&self, event: BridgeEvent) {
        let mut inner = self.inner.lock().unwrap();
        match event {
            BridgeEvent::Connected { serial, state } => {
                self.ensure_device_locked(&mut inner, &serial, state);
            }
            BridgeEvent::Disconnected { serial } => {
                // (I3) allocation becomes FREE once the current holder (if
                // any) releases it; we only update state here.
                if let Some(device) = inner.devices.get_mut(&serial) {
                    device.state = DeviceState::NotAvailable;
                }
                if let Some(monitor) = inner.monitors.get(&serial) {
                    monitor.set_state(DeviceState::NotAvailable);
                }
            }
            BridgeEvent::Changed { serial, state } => {
                self.ensure_device_locked(&mut inner, &serial, state);
            }
        }
        drop(inner);
        self.cond.notify_all();
    }

    fn ensure_device_locked(&self, inner: &mut Inner, serial: &str, state: DeviceState) {
        if let Some(device) = inner.devices.get_mut(serial) {
            device.state = state;
            // A bridge-observed state change lifts an Unresponsive
            // quarantine (§4.2): it does not lift a `force_allocate` filter
            // quarantine, which stays Ignored until explicitly released.
            if inner.unresponsive_quarantine.remove(serial) && device.allocation == Allocation::Ignored {
                device.allocation = Allocation::Free;
            }
        } else {
            // (I1) serial is unique among known devices; record created on
            // first connect and never destroyed.
            inner
                .devices
                .insert(serial.to_string(), Device::new(serial).with_state(state));
            inner
                .fastboot_locks
                .insert(serial.to_string(), Arc::new(TimeoutSemaphore::new(1)));
        }

        let monitor = inner
            .monitors
            .entry(serial.to_string())
            .or_insert_with(|| Arc::new(StateMonitor::new(state)));
        monitor.set_state(state);
    }

    fn try_take_free_device(
        &self,
        inner: &mut Inner,
        selection: Option<&DeviceSelection>,
    ) -> Option<String> {
        let global_filter = self.global_filter.lock().unwrap();
        let mut candidates: Vec<&str> = inner
            .devices
            .iter()
            .filter(|(_, d)| d.is_allocatable())
            .filter(|(_, d)| global_filter.as_ref().map(|f| f.matches(d)).unwrap_or(true))
            .filter(|(_, d)| selection.map(|s| s.matches(d)).unwrap_or(true))
            .map(|(serial, _)| serial.as_str())
            .collect();
        candidates.sort();
        let chosen = candidates.first().map(|s| s.to_string());
        if let Some(serial) = &chosen {
            if let Some(device) = inner.devices.get_mut(serial.as_str()) {
                device.allocation = Allocation::Allocated;
            }
        }
        chosen
    }

    /// Block until a free, `ONLINE` device satisfying `selection` (if any)
    /// is available, or `timeout` elapses. `None` on timeout or shutdown.
    #[instrument(skip(self, selection))]
    pub fn allocate(
        &self,
        timeout: Option<Duration>,
        selection: Option<&DeviceSelection>,
    ) -> Option<String> {
        let start = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.terminated {
                return None;
            }
            if let Some(serial) = self.try_take_free_device(&mut inner, selection) {
                debug!(serial, "allocated device");
                return Some(serial);
            }

            inner = match timeout {
                None => self.cond.wait(inner).unwrap(),
                Some(total) => {
                    let elapsed = start.elapsed();
                    if elapsed >= total {
                        return None;
                    }
                    let (guard, result) = self.cond.wait_timeout(inner, total - elapsed).unwrap();
                    if result.timed_out() {
                        let mut guard = guard;
                        return self.try_take_free_device(&mut guard, selection);
                    }
                    guard
                }
            };
        }
    }

    /// Force-allocate (quarantine) `serial` regardless of its selection
    /// eligibility, as used by the remote-control `filter` verb.
    pub fn force_allocate(&self, serial: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if let Some(device) = inner.devices.get_mut(serial) {
            if device.allocation == Allocation::Free {
                device.allocation = Allocation::Ignored;
                return true;
            }
        }
        false
    }

    /// Release `serial` (or every quarantined device, if `None`) from
    /// force-allocation, per the remote-control `unfilter`/`unfilter;*` verbs.
    pub fn release_filter(&self, serial: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        match serial {
            Some(s) => {
                if let Some(d) = inner.devices.get_mut(s) {
                    if d.allocation == Allocation::Ignored {
                        d.allocation = Allocation::Free;
                    }
                }
            }
            None => {
                for d in inner.devices.values_mut() {
                    if d.allocation == Allocation::Ignored {
                        d.allocation = Allocation::Free;
                    }
                }
            }
        }
        drop(inner);
        self.cond.notify_all();
    }

    /// Return `serial` to the pool per the disposition table in §4.2.
    #[instrument(skip(self))]
    pub fn free(&self, serial: &str, disposition: Disposition) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(device) = inner.devices.get_mut(serial) {
            match disposition {
                Disposition::Available => {
                    device.state = DeviceState::Online;
                    device.allocation = Allocation::Free;
                }
                Disposition::Unavailable => {
                    device.state = DeviceState::NotAvailable;
                    device.allocation = Allocation::Free;
                }
                Disposition::Unresponsive => {
                    device.state = DeviceState::Online;
                    device.allocation = Allocation::Ignored;
                    inner.unresponsive_quarantine.insert(serial.to_string());
                }
                Disposition::Ignored => {}
            }
            if let Some(monitor) = inner.monitors.get(serial) {
                monitor.set_state(device.state);
            }
        }
        drop(inner);
        self.cond.notify_all();
    }

    pub fn list_available(&self) -> Vec<Device> {
        self.inner
            .lock()
            .unwrap()
            .devices
            .values()
            .filter(|d| d.is_allocatable())
            .cloned()
            .collect()
    }

    pub fn list_allocated(&self) -> Vec<Device> {
        self.inner
            .lock()
            .unwrap()
            .devices
            .values()
            .filter(|d| d.allocation == Allocation::Allocated)
            .cloned()
            .collect()
    }

    pub fn list_unavailable(&self) -> Vec<Device> {
        self.inner
            .lock()
            .unwrap()
            .devices
            .values()
            .filter(|d| d.state == DeviceState::NotAvailable)
            .cloned()
            .collect()
    }

    /// Stop new allocations, signal all waiters with "none", and disconnect
    /// from the bridge.
    pub fn terminate(&self) {
        info!("terminating device manager");
        let mut inner = self.inner.lock().unwrap();
        inner.terminated = true;
        drop(inner);
        self.cond.notify_all();
    }

    /// `terminate()` plus forced transport termination even if wedged.
    pub fn terminate_hard(&self) {
        warn!("hard-terminating device manager");
        self.terminate();
        self.bridge.force_disconnect();
    }

    /// Register interest in fastboot polling. The manager polls `fastboot
    /// devices` only while at least one listener is registered.
    pub fn add_fastboot_listener(self: &Arc<Self>) {
        let prev = self.fastboot_listener_count.fetch_add(1, Ordering::SeqCst);
        if prev == 0 {
            self.spawn_fastboot_poller();
        }
    }

    pub fn remove_fastboot_listener(&self) {
        self.fastboot_listener_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// `waitForBootloader` (§4.3): registers a fastboot listener for the
    /// duration of the wait, so the poller is guaranteed to be running.
    pub fn wait_for_bootloader(self: &Arc<Self>, serial: &str, timeout: Duration) -> bool {
        self.add_fastboot_listener();
        let result = self
            .monitor_for(serial)
            .map(|m| m.wait_for_bootloader(timeout))
            .unwrap_or(false);
        self.remove_fastboot_listener();
        result
    }

    fn spawn_fastboot_poller(self: &Arc<Self>) {
        if self.fastboot_polling.swap(true, Ordering::SeqCst) {
            return;
        }
        let manager = self.clone();
        std::thread::spawn(move || {
            while manager.fastboot_listener_count.load(Ordering::SeqCst) > 0 {
                if let Ok(serials) = manager.fastboot.list_devices() {
                    let mut updated = false;
                    for serial in &serials {
                        // Try-acquire the per-device fastboot lock (§5):
                        // a poll-driven state update silently drops if a
                        // fastboot command is currently in flight for this
                        // serial; the next poll resynchronizes.
                        let lock = manager.inner.lock().unwrap().fastboot_locks.get(serial).cloned();
                        let _permit = match lock {
                            Some(lock) => match lock.try_acquire() {
                                Ok(permit) => Some(permit),
                                Err(_) => continue,
                            },
                            None => None,
                        };
                        let mut inner = manager.inner.lock().unwrap();
                        manager.ensure_device_locked(&mut inner, serial, DeviceState::Fastboot);
                        updated = true;
                    }
                    if updated {
                        manager.cond.notify_all();
                    }
                }
                std::thread::sleep(manager.fastboot_poll_interval);
            }
            manager.fastboot_polling.store(false, Ordering::SeqCst);
        });
    }
}
