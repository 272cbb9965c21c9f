use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{DebugBridge, DeviceError, DeviceState, FailureClass, RecoveryPolicyKind, TimeoutSemaphore};
use shared_config::AvailabilityRatios;
use tracing::{debug, info, instrument, warn};

use crate::recovery_policy::RecoveryPolicy;
use crate::state_monitor::StateMonitor;

/// Collaborators and per-device state the retry-with-recovery wrapper and
/// `recover()` need, bundled so call sites don't thread five parameters
/// through every device operation.
pub struct RecoveryContext {
    pub serial: String,
    pub monitor: Arc<StateMonitor>,
    pub policy: Arc<dyn RecoveryPolicy>,
    pub policy_kind: RecoveryPolicyKind,
    /// Capacity-1 semaphore serializing fastboot issuance for this device
    /// (P7): no two fastboot commands for the same serial overlap.
    pub fastboot_lock: Arc<TimeoutSemaphore>,
    /// The debug-bridge collaborator, needed directly by the reboot-path
    /// composites (`reboot`/`reboot_until_online`/`reboot_into_bootloader`/
    /// `reboot_into_recovery`), which issue `reboot`/`shell` themselves
    /// rather than going through a `RecoveryPolicy`.
    pub bridge: Arc<dyn DebugBridge>,
    /// Re-entrancy guard for the `AVAILABLE` policy's post-boot setup: a
    /// shell command issued during post-boot setup must not recurse back
    /// into a full `AVAILABLE` recovery if it itself times out.
    recovering: AtomicBool,
}

impl RecoveryContext {
    pub fn new(
        serial: impl Into<String>,
        monitor: Arc<StateMonitor>,
        policy: Arc<dyn RecoveryPolicy>,
        policy_kind: RecoveryPolicyKind,
        fastboot_lock: Arc<TimeoutSemaphore>,
        bridge: Arc<dyn DebugBridge>,
    ) -> Self {
        Self {
            serial: serial.into(),
            monitor,
            policy,
            policy_kind,
            fastboot_lock,
            bridge,
            recovering: AtomicBool::new(false),
        }
    }
}

/// Execute `action` through the uniform retry-with-recovery wrapper (§4.4).
/// `description` is used only for diagnostics and the terminal error message.
#[instrument(skip(ctx, action), fields(serial = %ctx.serial, description))]
pub fn execute_with_recovery<F, T>(
    ctx: &RecoveryContext,
    description: &str,
    retry_budget: u32,
    mut action: F,
) -> Result<T, DeviceError>
where
    F: FnMut() -> Result<T, DeviceError>,
{
    for attempt in 0..retry_budget.max(1) {
        match action() {
            Ok(value) => return Ok(value),
            Err(err) => match err.classify() {
                FailureClass::Transient => {
                    debug!(attempt, error = %err, "transient failure, recovering and retrying");
                    recover(ctx)?;
                }
                FailureClass::Logic => {
                    // Not retried: surfaced to the caller as-is.
                    return Err(err);
                }
                FailureClass::Gone | FailureClass::Wedged | FailureClass::Fatal => {
                    return Err(err);
                }
            },
        }
    }

    warn!(description, "retry budget exhausted");
    Err(DeviceError::DeviceUnresponsive(description.to_string()))
}

/// `recover()` per §4.4: honors the device's `recoveryPolicy`.
pub fn recover(ctx: &RecoveryContext) -> Result<(), DeviceError> {
    match ctx.policy_kind {
        RecoveryPolicyKind::None => {
            std::thread::sleep(Duration::from_millis(250));
            Ok(())
        }
        RecoveryPolicyKind::Online => ctx.policy.recover_device(&ctx.monitor, true),
        RecoveryPolicyKind::Available => {
            if ctx.recovering.swap(true, Ordering::SeqCst) {
                // Already recovering on this thread's call stack (post-boot
                // setup issuing a device operation that itself failed);
                // don't recurse into a second full recovery.
                return Ok(());
            }
            let result = (|| {
                ctx.policy.recover_device(&ctx.monitor, false)?;
                run_post_boot_setup(ctx)
            })();
            ctx.recovering.store(false, Ordering::SeqCst);
            result
        }
    }
}

/// Post-boot setup performed by the core itself once a full recovery
/// reaches `AVAILABLE`: reenable privileged shell, dismiss lock screen. The
/// device-level shell/unlock transport is an external collaborator (§6); in
/// the absence of a concrete bridge this is a no-op hook tests can swap.
fn run_post_boot_setup(ctx: &RecoveryContext) -> Result<(), DeviceError> {
    info!(serial = %ctx.serial, "running post-boot setup");
    Ok(())
}

/// Fastboot-path recovery (§4.4): operations issued while the device is in
/// fastboot route here instead of the normal `recover()`. Waits for either a
/// fastboot probe or a recovery escalation (reboot into online, then into
/// bootloader).
pub fn recover_from_bootloader(ctx: &RecoveryContext, timeout: Duration) -> Result<(), DeviceError> {
    let _permit = ctx
        .fastboot_lock
        .acquire_timeout(Some(timeout))
        .map_err(|e| DeviceError::FastbootError(e.to_string()))?;

    if ctx.monitor.current_state() == DeviceState::Fastboot {
        return Ok(());
    }

    ctx.policy.recover_device_bootloader(&ctx.monitor)
}

static PROBE_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

/// Lightweight "package manager responsive" query for Phase B of
/// `waitForAvailable` (§4.3).
fn package_manager_responsive(ctx: &RecoveryContext) -> bool {
    match ctx
        .bridge
        .shell(&ctx.serial, "pm path android", Duration::from_secs(30))
    {
        Ok(result) => !result.timed_out && result.exit_code == Some(0),
        Err(_) => false,
    }
}

/// Write-then-read-then-delete a random token on external storage for Phase C
/// of `waitForAvailable` (§4.3).
fn external_storage_writable(ctx: &RecoveryContext) -> bool {
    let token = format!(
        "fleet-probe-{}-{}",
        std::process::id(),
        PROBE_SEQ.fetch_add(1, Ordering::Relaxed)
    );
    let path = format!("/sdcard/.fleet_probe_{token}");
    let command = format!("echo {token} > {path} && cat {path} && rm -f {path}");
    match ctx.bridge.shell(&ctx.serial, &command, Duration::from_secs(30)) {
        Ok(result) => !result.timed_out && result.stdout.contains(&token),
        Err(_) => false,
    }
}

fn unlock_device(ctx: &RecoveryContext) -> Result<(), DeviceError> {
    ctx.bridge
        .shell(&ctx.serial, "input keyevent 82", Duration::from_secs(10))?;
    Ok(())
}

/// `reboot()` (§4.4): adb reboot -> wait-online -> (if encrypted, unlock) ->
/// wait-available -> post-boot setup.
#[instrument(skip(ctx, ratios), fields(serial = %ctx.serial))]
pub fn reboot(
    ctx: &RecoveryContext,
    encrypted: bool,
    online_timeout: Duration,
    available_timeout: Duration,
    ratios: &AvailabilityRatios,
    poll_interval: Duration,
) -> Result<(), DeviceError> {
    ctx.bridge.reboot(&ctx.serial, "")?;
    if !ctx.monitor.wait_for_online(online_timeout) {
        return Err(DeviceError::DeviceNotAvailable(format!(
            "{} did not come online after reboot",
            ctx.serial
        )));
    }
    if encrypted {
        unlock_device(ctx)?;
    }
    let available = ctx.monitor.wait_for_available(
        available_timeout,
        ratios,
        poll_interval,
        || package_manager_responsive(ctx),
        || external_storage_writable(ctx),
    );
    if !available {
        return Err(DeviceError::DeviceNotAvailable(format!(
            "{} did not become available after reboot",
            ctx.serial
        )));
    }
    run_post_boot_setup(ctx)
}

/// `rebootUntilOnline()` (§4.4): adb reboot -> wait-online. No post-boot setup.
#[instrument(skip(ctx), fields(serial = %ctx.serial))]
pub fn reboot_until_online(ctx: &RecoveryContext, online_timeout: Duration) -> Result<(), DeviceError> {
    ctx.bridge.reboot(&ctx.serial, "")?;
    if ctx.monitor.wait_for_online(online_timeout) {
        Ok(())
    } else {
        Err(DeviceError::DeviceNotAvailable(format!(
            "{} did not come online after reboot",
            ctx.serial
        )))
    }
}

/// `rebootIntoBootloader()` (§4.4): adb reboot "bootloader" -> wait-bootloader,
/// falling back to `recover_from_bootloader` if the device never shows up in
/// fastboot on its own.
#[instrument(skip(ctx), fields(serial = %ctx.serial))]
pub fn reboot_into_bootloader(ctx: &RecoveryContext, timeout: Duration) -> Result<(), DeviceError> {
    ctx.bridge.reboot(&ctx.serial, "bootloader")?;
    if ctx.monitor.wait_for_bootloader(timeout) {
        return Ok(());
    }
    recover_from_bootloader(ctx, timeout)
}

/// `rebootIntoRecovery()` (§4.4): if currently in fastboot, reboot-until-online
/// first, then adb reboot "recovery" -> wait-recovery.
#[instrument(skip(ctx), fields(serial = %ctx.serial))]
pub fn reboot_into_recovery(
    ctx: &RecoveryContext,
    online_timeout: Duration,
    recovery_timeout: Duration,
) -> Result<(), DeviceError> {
    if ctx.monitor.current_state() == DeviceState::Fastboot {
        reboot_until_online(ctx, online_timeout)?;
    }
    ctx.bridge.reboot(&ctx.serial, "recovery")?;
    if ctx.monitor.wait_for_recovery(recovery_timeout) {
        Ok(())
    } else {
        Err(DeviceError::DeviceNotAvailable(format!(
            "{} did not reach RECOVERY after reboot",
            ctx.serial
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery_policy::RecoveryPolicy;
    use fleet_core::ShellResult;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    struct NoopBridge;
    impl DebugBridge for NoopBridge {
        fn list_devices(&self) -> Result<Vec<(String, DeviceState)>, DeviceError> {
            Ok(Vec::new())
        }
        fn subscribe(&self, _listener: Box<dyn fleet_core::BridgeEventListener>) -> u64 {
            0
        }
        fn unsubscribe(&self, _subscription_id: u64) {}
        fn shell(&self, _: &str, _: &str, _: Duration) -> Result<ShellResult, DeviceError> {
            unimplemented!()
        }
        fn push(&self, _: &str, _: &str, _: &str) -> Result<(), DeviceError> {
            unimplemented!()
        }
        fn pull(&self, _: &str, _: &str, _: &str) -> Result<(), DeviceError> {
            unimplemented!()
        }
        fn install(&self, _: &str, _: &str) -> Result<(), DeviceError> {
            unimplemented!()
        }
        fn uninstall(&self, _: &str, _: &str) -> Result<(), DeviceError> {
            unimplemented!()
        }
        fn reboot(&self, _: &str, _: &str) -> Result<(), DeviceError> {
            unimplemented!()
        }
        fn get_properties(&self, _: &str) -> Result<HashMap<String, String>, DeviceError> {
            Ok(HashMap::new())
        }
        fn force_disconnect(&self) {}
    }

    /// A bridge double whose `reboot()` drives a shared `StateMonitor`
    /// directly (standing in for the bridge's real async connect/disconnect
    /// callbacks) and whose `shell()` answers the availability probes.
    struct RebootBridge {
        monitor: Arc<StateMonitor>,
        shell_calls: StdMutex<Vec<String>>,
    }

    impl DebugBridge for RebootBridge {
        fn list_devices(&self) -> Result<Vec<(String, DeviceState)>, DeviceError> {
            Ok(Vec::new())
        }
        fn subscribe(&self, _listener: Box<dyn fleet_core::BridgeEventListener>) -> u64 {
            0
        }
        fn unsubscribe(&self, _subscription_id: u64) {}
        fn shell(&self, _serial: &str, command: &str, _timeout: Duration) -> Result<ShellResult, DeviceError> {
            self.shell_calls.lock().unwrap().push(command.to_string());
            if command.starts_with("pm path") {
                return Ok(ShellResult {
                    stdout: "package:/system/framework/android.jar".to_string(),
                    stderr: String::new(),
                    exit_code: Some(0),
                    timed_out: false,
                });
            }
            if let Some(token) = command.strip_prefix("echo ").and_then(|rest| rest.split_whitespace().next()) {
                return Ok(ShellResult {
                    stdout: token.to_string(),
                    stderr: String::new(),
                    exit_code: Some(0),
                    timed_out: false,
                });
            }
            Ok(ShellResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(0),
                timed_out: false,
            })
        }
        fn push(&self, _: &str, _: &str, _: &str) -> Result<(), DeviceError> {
            unimplemented!()
        }
        fn pull(&self, _: &str, _: &str, _: &str) -> Result<(), DeviceError> {
            unimplemented!()
        }
        fn install(&self, _: &str, _: &str) -> Result<(), DeviceError> {
            unimplemented!()
        }
        fn uninstall(&self, _: &str, _: &str) -> Result<(), DeviceError> {
            unimplemented!()
        }
        fn reboot(&self, _serial: &str, target: &str) -> Result<(), DeviceError> {
            match target {
                "bootloader" => self.monitor.set_state(DeviceState::Fastboot),
                "recovery" => self.monitor.set_state(DeviceState::Recovery),
                _ => self.monitor.set_state(DeviceState::Online),
            }
            Ok(())
        }
        fn get_properties(&self, _: &str) -> Result<HashMap<String, String>, DeviceError> {
            Ok(HashMap::new())
        }
        fn force_disconnect(&self) {}
    }

    struct CountingRecoveryPolicy {
        recoveries: AtomicU32,
        online_after: u32,
    }

    impl RecoveryPolicy for CountingRecoveryPolicy {
        fn recover_device(&self, monitor: &StateMonitor, _online_only: bool) -> Result<(), DeviceError> {
            let count = self.recoveries.fetch_add(1, Ordering::SeqCst) + 1;
            if count >= self.online_after {
                monitor.set_state(DeviceState::Online);
            }
            Ok(())
        }
        fn recover_device_bootloader(&self, _monitor: &StateMonitor) -> Result<(), DeviceError> {
            Ok(())
        }
        fn recover_device_recovery(&self, _monitor: &StateMonitor) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn ctx(policy: Arc<dyn RecoveryPolicy>) -> RecoveryContext {
        RecoveryContext::new(
            "S1",
            Arc::new(StateMonitor::new(DeviceState::Offline)),
            policy,
            RecoveryPolicyKind::Online,
            Arc::new(TimeoutSemaphore::new(1)),
            Arc::new(NoopBridge),
        )
    }

    #[test]
    fn succeeds_after_enough_transient_retries() {
        let policy = Arc::new(CountingRecoveryPolicy {
            recoveries: AtomicU32::new(0),
            online_after: 2,
        });
        let context = ctx(policy);

        let mut attempts = 0;
        let result: Result<(), DeviceError> = execute_with_recovery(&context, "test op", 4, || {
            attempts += 1;
            if context.monitor.current_state() == DeviceState::Online {
                Ok(())
            } else {
                Err(DeviceError::timeout("waiting for device to come online"))
            }
        });

        assert!(result.is_ok());
        assert!(attempts >= 2);
    }

    #[test]
    fn exhausts_retry_budget_and_surfaces_unresponsive() {
        let policy = Arc::new(CountingRecoveryPolicy {
            recoveries: AtomicU32::new(0),
            online_after: 100,
        });
        let context = ctx(policy);

        let result: Result<(), DeviceError> = execute_with_recovery(&context, "test op", 3, || {
            Err(DeviceError::timeout("never recovers"))
        });

        assert!(matches!(result, Err(DeviceError::DeviceUnresponsive(_))));
    }

    #[test]
    fn logic_failure_is_not_retried() {
        let policy = Arc::new(CountingRecoveryPolicy {
            recoveries: AtomicU32::new(0),
            online_after: 1,
        });
        let context = ctx(policy);

        let mut calls = 0;
        let result: Result<(), DeviceError> = execute_with_recovery(&context, "test op", 5, || {
            calls += 1;
            Err(DeviceError::InvalidSelection("bad args".to_string()))
        });

        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    fn reboot_ctx(initial: DeviceState) -> (RecoveryContext, Arc<StateMonitor>) {
        let monitor = Arc::new(StateMonitor::new(initial));
        let policy = Arc::new(CountingRecoveryPolicy {
            recoveries: AtomicU32::new(0),
            online_after: 1,
        });
        let bridge = Arc::new(RebootBridge {
            monitor: monitor.clone(),
            shell_calls: StdMutex::new(Vec::new()),
        });
        let context = RecoveryContext::new(
            "S1",
            monitor.clone(),
            policy,
            RecoveryPolicyKind::Available,
            Arc::new(TimeoutSemaphore::new(1)),
            bridge,
        );
        (context, monitor)
    }

    #[test]
    fn reboot_until_online_returns_once_the_device_reconnects() {
        let (context, _monitor) = reboot_ctx(DeviceState::Offline);
        let result = reboot_until_online(&context, Duration::from_secs(1));
        assert!(result.is_ok());
        assert_eq!(context.monitor.current_state(), DeviceState::Online);
    }

    #[test]
    fn reboot_into_bootloader_reaches_fastboot() {
        let (context, _monitor) = reboot_ctx(DeviceState::Online);
        let result = reboot_into_bootloader(&context, Duration::from_secs(1));
        assert!(result.is_ok());
        assert_eq!(context.monitor.current_state(), DeviceState::Fastboot);
    }

    #[test]
    fn reboot_into_recovery_passes_through_online_when_starting_in_fastboot() {
        let (context, _monitor) = reboot_ctx(DeviceState::Fastboot);
        let result = reboot_into_recovery(&context, Duration::from_secs(1), Duration::from_secs(1));
        assert!(result.is_ok());
        assert_eq!(context.monitor.current_state(), DeviceState::Recovery);
    }

    #[test]
    fn reboot_runs_availability_probes_and_post_boot_setup() {
        let (context, _monitor) = reboot_ctx(DeviceState::Offline);
        let ratios = AvailabilityRatios {
            online_fraction: 0.2,
            package_manager_fraction: 0.6,
            storage_fraction: 0.2,
            min_phase_millis: 5,
            max_phase_millis: 1000,
        };
        let result = reboot(
            &context,
            false,
            Duration::from_secs(1),
            Duration::from_millis(200),
            &ratios,
            Duration::from_millis(5),
        );
        assert!(result.is_ok());
    }
}
