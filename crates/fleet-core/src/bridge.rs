use std::time::Duration;

use crate::device::DeviceState;
use crate::error::DeviceError;

/// A raw state-change notification as reported by the debug-bridge.
#[derive(Debug, Clone)]
pub enum BridgeEvent {
    Connected { serial: String, state: DeviceState },
    Disconnected { serial: String },
    Changed { serial: String, state: DeviceState },
}

/// Receives [`BridgeEvent`]s fanned out by a [`DebugBridge`] subscription.
/// Implementations must be cheap and non-blocking: the bridge dispatches to
/// all subscribers synchronously.
pub trait BridgeEventListener: Send + Sync {
    fn on_event(&self, event: BridgeEvent);
}

/// Result of invoking the device's shell transport for a single command.
#[derive(Debug, Clone, Default)]
pub struct ShellResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

/// The debug-bridge collaborator contract (§6). This crate never implements
/// a concrete transport — only the shape every concrete bridge (real device,
/// emulator, mock for tests) must provide.
pub trait DebugBridge: Send + Sync {
    /// Enumerate currently visible devices as (serial, raw state) pairs.
    fn list_devices(&self) -> Result<Vec<(String, DeviceState)>, DeviceError>;

    /// Subscribe to connect/disconnect/state-change callbacks. Returns a
    /// subscription id that can later be passed to [`unsubscribe`].
    fn subscribe(&self, listener: Box<dyn BridgeEventListener>) -> u64;

    fn unsubscribe(&self, subscription_id: u64);

    /// Execute a shell command on `serial` with a per-call timeout.
    fn shell(&self, serial: &str, command: &str, timeout: Duration) -> Result<ShellResult, DeviceError>;

    fn push(&self, serial: &str, local_path: &str, remote_path: &str) -> Result<(), DeviceError>;

    fn pull(&self, serial: &str, remote_path: &str, local_path: &str) -> Result<(), DeviceError>;

    fn install(&self, serial: &str, package_path: &str) -> Result<(), DeviceError>;

    fn uninstall(&self, serial: &str, package_name: &str) -> Result<(), DeviceError>;

    /// `target` is `""` for a normal reboot, or `"bootloader"`/`"recovery"`.
    fn reboot(&self, serial: &str, target: &str) -> Result<(), DeviceError>;

    fn get_properties(&self, serial: &str) -> Result<std::collections::HashMap<String, String>, DeviceError>;

    /// Sever the underlying transport even if a call is in-flight and
    /// wedged. Used by `terminateHard`.
    fn force_disconnect(&self);
}

/// Outcome of one `fastboot -s <serial> <args...>` invocation.
#[derive(Debug, Clone, Default)]
pub struct FastbootResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
    pub timed_out: bool,
}

/// The fastboot collaborator contract (§6).
pub trait FastbootTransport: Send + Sync {
    fn run(&self, serial: &str, args: &[String], timeout: Duration) -> Result<FastbootResult, DeviceError>;

    /// List serials currently visible to `fastboot devices`.
    fn list_devices(&self) -> Result<Vec<String>, DeviceError>;
}

lazy_static::lazy_static! {
    /// `^<var>:\s(.*)\s` per §6, compiled once and reused by every `getvar` parse.
    static ref GETVAR_LINE: regex::Regex = regex::Regex::new(r"^(?P<var>[^:]+):\s(?P<value>.*)\s*$").unwrap();
}

/// Parse a single line of `fastboot getvar <name>` output using the regex
/// pinned by §6: `^<var>:\s(.*)\s`.
pub fn parse_getvar_line(line: &str) -> Option<(String, String)> {
    let caps = GETVAR_LINE.captures(line)?;
    Some((caps["var"].to_string(), caps["value"].trim_end().to_string()))
}
