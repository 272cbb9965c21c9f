use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fleet_core::{
    BridgeEventListener, DebugBridge, DeviceError, DeviceState, FastbootResult, FastbootTransport,
    ShellResult,
};
use fleet_scheduler::command::Command;
use fleet_scheduler::device_manager::DeviceManager;
use fleet_scheduler::logging::init_logging;
use fleet_scheduler::queue::CommandQueue;
use fleet_scheduler::recovery_policy::DefaultRecoveryPolicy;
use fleet_scheduler::remote_control::RemoteControl;
use fleet_scheduler::scheduler::{Invoker, Scheduler};
use shared_config::SchedulerConfig;
use tracing::{info, warn};

/// Placeholder `DebugBridge`/`FastbootTransport` until a real adb/fastboot
/// transport is wired in (§6: both are external collaborators supplied by
/// the integrator, not owned by this crate).
struct UnconfiguredBridge;

impl DebugBridge for UnconfiguredBridge {
    fn list_devices(&self) -> Result<Vec<(String, DeviceState)>, DeviceError> {
        Ok(Vec::new())
    }
    fn subscribe(&self, _listener: Box<dyn BridgeEventListener>) -> u64 {
        0
    }
    fn unsubscribe(&self, _subscription_id: u64) {}
    fn shell(&self, _serial: &str, _command: &str, _timeout: Duration) -> Result<ShellResult, DeviceError> {
        Err(DeviceError::FatalHost("no debug bridge configured".to_string()))
    }
    fn push(&self, _serial: &str, _local_path: &str, _remote_path: &str) -> Result<(), DeviceError> {
        Err(DeviceError::FatalHost("no debug bridge configured".to_string()))
    }
    fn pull(&self, _serial: &str, _remote_path: &str, _local_path: &str) -> Result<(), DeviceError> {
        Err(DeviceError::FatalHost("no debug bridge configured".to_string()))
    }
    fn install(&self, _serial: &str, _package_path: &str) -> Result<(), DeviceError> {
        Err(DeviceError::FatalHost("no debug bridge configured".to_string()))
    }
    fn uninstall(&self, _serial: &str, _package_name: &str) -> Result<(), DeviceError> {
        Err(DeviceError::FatalHost("no debug bridge configured".to_string()))
    }
    fn reboot(&self, _serial: &str, _target: &str) -> Result<(), DeviceError> {
        Err(DeviceError::FatalHost("no debug bridge configured".to_string()))
    }
    fn get_properties(&self, _serial: &str) -> Result<HashMap<String, String>, DeviceError> {
        Ok(HashMap::new())
    }
    fn force_disconnect(&self) {}
}

struct UnconfiguredFastboot;

impl FastbootTransport for UnconfiguredFastboot {
    fn run(&self, _serial: &str, _args: &[String], _timeout: Duration) -> Result<FastbootResult, DeviceError> {
        Err(DeviceError::FatalHost("no fastboot transport configured".to_string()))
    }
    fn list_devices(&self) -> Result<Vec<String>, DeviceError> {
        Ok(Vec::new())
    }
}

/// No-op invocation runner, wired in until a real command invocation path
/// (§6, external collaborator) is supplied by the integrator.
struct UnconfiguredInvoker;

impl Invoker for UnconfiguredInvoker {
    fn invoke(
        &self,
        command: &Command,
        device_serial: &str,
        _reschedule: &mut dyn FnMut(Vec<String>),
    ) -> Result<(), DeviceError> {
        warn!(command_id = %command.id, serial = device_serial, "no invoker configured; dropping command");
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = SchedulerConfig::load().unwrap_or_else(|e| {
        eprintln!("failed to load configuration: {e}. using defaults.");
        SchedulerConfig::default()
    });

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("failed to initialize logging: {e}");
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    }

    info!(?config, "starting fleet-scheduler");

    let devices = DeviceManager::new(
        Arc::new(UnconfiguredBridge),
        Arc::new(UnconfiguredFastboot),
        Duration::from_millis(config.fastboot_poll_interval_millis),
    );
    let queue = Arc::new(CommandQueue::new());
    let recovery_policy = Arc::new(DefaultRecoveryPolicy::default());
    let scheduler = Scheduler::new(queue, devices.clone(), Arc::new(UnconfiguredInvoker), recovery_policy, config.clone());
    scheduler.start();

    let remote_control = RemoteControl::new(devices, scheduler);
    remote_control.start(&config.remote_control_bind_addr)?;
    if let Some(port) = remote_control.port() {
        info!(port, "remote control ready");
    }

    info!("fleet-scheduler running; park main thread");
    loop {
        std::thread::park();
    }
}
