use std::collections::HashMap;

/// Lifecycle state of a device as last observed from the debug-bridge (or a
/// fastboot poll). Distinct from [`Allocation`], which tracks whether the
/// scheduler currently holds the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    Online,
    Offline,
    Fastboot,
    Recovery,
    NotAvailable,
}

impl DeviceState {
    pub fn is_online(&self) -> bool {
        matches!(self, DeviceState::Online)
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeviceState::Online => "ONLINE",
            DeviceState::Offline => "OFFLINE",
            DeviceState::Fastboot => "FASTBOOT",
            DeviceState::Recovery => "RECOVERY",
            DeviceState::NotAvailable => "NOT_AVAILABLE",
        };
        write!(f, "{s}")
    }
}

/// Whether the device manager's pool currently holds, or has handed out, a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Allocation {
    Free,
    Allocated,
    Ignored,
}

/// The disposition a worker hands back to [`free`](crate) when it is done with a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Available,
    Unavailable,
    Unresponsive,
    Ignored,
}

/// How aggressively the retry wrapper's `recover()` step should escalate for
/// this particular device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicyKind {
    /// Recover until the device reaches `ONLINE` and is available for work.
    #[default]
    Available,
    /// Recover only until the device is visible again; do not wait for
    /// package-manager/external-storage readiness.
    Online,
    /// Never attempt recovery; let the caller's action fail outright.
    None,
}

/// One accessible endpoint known to the device manager.
///
/// `serial` is stable across disconnects (I1: unique among known devices):
/// the record is created on first bridge-reported connect and is never
/// destroyed, only ever transitioned to `NOT_AVAILABLE`, so a later
/// reconnect reuses it.
#[derive(Debug, Clone)]
pub struct Device {
    pub serial: String,
    pub state: DeviceState,
    pub allocation: Allocation,
    /// Runtime properties as reported by the bridge (refreshed lazily).
    pub properties: HashMap<String, String>,
    pub recovery_policy: RecoveryPolicyKind,
    pub product_type: Option<String>,
    pub product_variant: Option<String>,
    pub emulator: bool,
    pub null_device: bool,
}

impl Device {
    pub fn new(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            state: DeviceState::Offline,
            allocation: Allocation::Free,
            properties: HashMap::new(),
            recovery_policy: RecoveryPolicyKind::default(),
            product_type: None,
            product_variant: None,
            emulator: false,
            null_device: false,
        }
    }

    pub fn with_state(mut self, state: DeviceState) -> Self {
        self.state = state;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn with_product(mut self, product_type: impl Into<String>) -> Self {
        self.product_type = Some(product_type.into());
        self
    }

    pub fn with_emulator(mut self, emulator: bool) -> Self {
        self.emulator = emulator;
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// True if this device is eligible to be scanned for allocation: free and
    /// currently visible to the bridge.
    pub fn is_allocatable(&self) -> bool {
        self.allocation == Allocation::Free && self.state == DeviceState::Online
    }
}
