use std::time::Duration;

use fleet_core::DeviceError;
use tracing::{info, warn};

use crate::state_monitor::StateMonitor;

/// External collaborator contract (§4.5). The core calls these three entry
/// points from `recover()` and never decides on its own which devices to
/// recover versus discard (non-goal) — it only applies whatever policy is
/// supplied here.
pub trait RecoveryPolicy: Send + Sync {
    /// Bring the device to `ONLINE` (and available, unless `online_only`).
    fn recover_device(&self, monitor: &StateMonitor, online_only: bool) -> Result<(), DeviceError>;

    /// Bring the device to `FASTBOOT`.
    fn recover_device_bootloader(&self, monitor: &StateMonitor) -> Result<(), DeviceError>;

    /// Bring the device to `RECOVERY`.
    fn recover_device_recovery(&self, monitor: &StateMonitor) -> Result<(), DeviceError>;
}

/// Reference policy (§4.5): settle briefly for the bridge to notice the
/// reconnect, then wait-online with a configured budget. The core does not
/// depend on this specific implementation; it is provided so the crate is
/// usable standalone and so tests have something concrete to exercise.
pub struct DefaultRecoveryPolicy {
    pub settle_time: Duration,
    pub online_timeout: Duration,
}

impl Default for DefaultRecoveryPolicy {
    fn default() -> Self {
        Self {
            settle_time: Duration::from_secs(2),
            online_timeout: Duration::from_secs(30),
        }
    }
}

impl RecoveryPolicy for DefaultRecoveryPolicy {
    fn recover_device(&self, monitor: &StateMonitor, online_only: bool) -> Result<(), DeviceError> {
        std::thread::sleep(self.settle_time);

        if !monitor.wait_for_online(self.online_timeout) {
            warn!(online_only, "recovery failed: device never came online");
            return Err(DeviceError::DeviceNotAvailable(
                "device did not return online within the recovery budget".to_string(),
            ));
        }

        if online_only {
            info!("recovery reached ONLINE (online-only policy)");
            return Ok(());
        }

        info!("recovery reached ONLINE; caller is responsible for availability checks");
        Ok(())
    }

    fn recover_device_bootloader(&self, monitor: &StateMonitor) -> Result<(), DeviceError> {
        if !monitor.wait_for_bootloader(self.online_timeout) {
            return Err(DeviceError::DeviceNotAvailable(
                "device did not reach FASTBOOT within the recovery budget".to_string(),
            ));
        }
        Ok(())
    }

    fn recover_device_recovery(&self, monitor: &StateMonitor) -> Result<(), DeviceError> {
        if !monitor.wait_for_recovery(self.online_timeout) {
            return Err(DeviceError::DeviceNotAvailable(
                "device did not reach RECOVERY within the recovery budget".to_string(),
            ));
        }
        Ok(())
    }
}
