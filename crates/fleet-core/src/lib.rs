pub mod bridge;
pub mod device;
pub mod error;
pub mod selection;
pub mod semaphore;

pub use bridge::{BridgeEvent, BridgeEventListener, DebugBridge, FastbootResult, FastbootTransport, ShellResult};
pub use device::{Allocation, Device, DeviceState, Disposition, RecoveryPolicyKind};
pub use error::{DeviceError, FailureClass};
pub use selection::{DeviceSelection, DEFAULT_SERIAL_ENV_VAR};
pub use semaphore::{SemaphoreError, SemaphorePermit, TimeoutSemaphore};
