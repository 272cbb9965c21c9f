use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::device::Device;

/// Name of the environment variable that supplies a default serial when
/// `serials` is empty (`ANDROID_SERIAL` in the upstream tool; kept
/// configurable here since the exact name is a deployment detail).
pub const DEFAULT_SERIAL_ENV_VAR: &str = "ANDROID_SERIAL";

/// Device-selection criteria: the conjunctive predicate a [`Device`] must
/// satisfy to match a Command.
///
/// Matching is conjunctive across groups (serials AND excludeSerials AND
/// productTypes AND properties AND emulator/nullDevice) and disjunctive
/// within each multi-valued group.
#[derive(Debug, Clone, Default)]
pub struct DeviceSelection {
    pub serials: HashSet<String>,
    pub exclude_serials: HashSet<String>,
    /// Each entry is either a bare product type (`"taimen"`) or a
    /// `type:variant`-qualified one (`"taimen:userdebug"`).
    pub product_types: HashSet<String>,
    pub properties: HashMap<String, String>,
    pub emulator: Option<bool>,
    pub null_device: Option<bool>,

    /// Lazily resolved, cached once: the env-var fallback serial, if any.
    /// `OnceLock` rather than a plain field because `DeviceSelection` is
    /// constructed once per Command and evaluated repeatedly (P6: matching
    /// must be idempotent), so the cache must survive across calls to
    /// `matches` on a `&self` receiver.
    env_serial: OnceLock<Option<String>>,
}

impl DeviceSelection {
    pub fn new() -> Self {
        Self::default()
    }

    fn env_fallback(&self) -> Option<&str> {
        self.env_serial
            .get_or_init(|| std::env::var(DEFAULT_SERIAL_ENV_VAR).ok())
            .as_deref()
    }

    /// The conjunctive predicate described in §3. Idempotent (P6): calling
    /// this repeatedly against an unchanged `device` and `self` always
    /// returns the same answer, because the only mutable state (the cached
    /// env fallback) is resolved once and then fixed.
    pub fn matches(&self, device: &Device) -> bool {
        if self.exclude_serials.contains(&device.serial) {
            return false;
        }

        if !self.serials.is_empty() {
            if !self.serials.contains(&device.serial) {
                return false;
            }
        } else if let Some(fallback) = self.env_fallback() {
            if device.serial != fallback {
                return false;
            }
        }

        if !self.product_types.is_empty() {
            let matched = self.product_types.iter().any(|spec| match spec.split_once(':') {
                Some((ty, variant)) => {
                    device.product_type.as_deref() == Some(ty)
                        && device.product_variant.as_deref() == Some(variant)
                }
                None => device.product_type.as_deref() == Some(spec.as_str()),
            });
            if !matched {
                return false;
            }
        }

        for (key, expected) in &self.properties {
            if device.property(key) != Some(expected.as_str()) {
                return false;
            }
        }

        if let Some(want_emulator) = self.emulator {
            if device.emulator != want_emulator {
                return false;
            }
        }

        if let Some(want_null) = self.null_device {
            if device.null_device != want_null {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceState;

    fn online(serial: &str) -> Device {
        Device::new(serial).with_state(DeviceState::Online)
    }

    #[test]
    fn empty_selection_matches_any_device_without_env_var() {
        std::env::remove_var(DEFAULT_SERIAL_ENV_VAR);
        let sel = DeviceSelection::new();
        assert!(sel.matches(&online("S1")));
        assert!(sel.matches(&online("S2")));
    }

    #[test]
    fn exclude_serials_never_matches_excluded() {
        let mut sel = DeviceSelection::new();
        sel.exclude_serials.insert("S1".to_string());
        assert!(!sel.matches(&online("S1")));
        assert!(sel.matches(&online("S2")));
    }

    #[test]
    fn product_type_qualified_variant() {
        let mut sel = DeviceSelection::new();
        sel.product_types.insert("taimen:userdebug".to_string());
        let mut d = online("S1");
        d.product_type = Some("taimen".to_string());
        d.product_variant = Some("userdebug".to_string());
        assert!(sel.matches(&d));

        d.product_variant = Some("user".to_string());
        assert!(!sel.matches(&d));
    }

    #[test]
    fn properties_conjunction() {
        let mut sel = DeviceSelection::new();
        sel.properties.insert("ro.build.type".to_string(), "userdebug".to_string());
        let d = online("S1").with_property("ro.build.type", "userdebug");
        assert!(sel.matches(&d));
        let d2 = online("S1").with_property("ro.build.type", "user");
        assert!(!sel.matches(&d2));
    }

    #[test]
    fn matches_is_idempotent() {
        let mut sel = DeviceSelection::new();
        sel.serials.insert("S1".to_string());
        let d = online("S1");
        assert_eq!(sel.matches(&d), sel.matches(&d));
        assert!(sel.matches(&d));
    }
}
