use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SharedConfigError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Environment error: {0}")]
    Environment(String),
}

pub type Result<T> = std::result::Result<T, SharedConfigError>;

/// Ambient daemon logging configuration, independent of any test-result
/// reporting (that remains the external harness's concern).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub rotation: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            rotation: None,
        }
    }
}

/// The α/β/γ time-budget ratios for the three-phase `waitForAvailable`
/// predicate, with absolute floors/ceilings so a tiny or huge overall
/// timeout still leaves each phase a sane minimum window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityRatios {
    pub online_fraction: f64,
    pub package_manager_fraction: f64,
    pub storage_fraction: f64,
    pub min_phase_millis: u64,
    pub max_phase_millis: u64,
}

impl Default for AvailabilityRatios {
    fn default() -> Self {
        Self {
            online_fraction: 0.2,
            package_manager_fraction: 0.6,
            storage_fraction: 0.2,
            min_phase_millis: 500,
            max_phase_millis: 120_000,
        }
    }
}

/// Ambient daemon knobs for the fleet scheduler. Deliberately excludes any
/// notion of a test's `configurationHandle` or device-selection defaults
/// beyond the single `ANDROID_SERIAL`-equivalent environment fallback
/// already specified for device selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Bind address for the remote-control listener, e.g. `"127.0.0.1:0"`
    /// for an ephemeral port.
    pub remote_control_bind_addr: String,
    /// Default retry budget `k` for the device-operation wrapper.
    pub default_retry_budget: u32,
    pub availability: AvailabilityRatios,
    /// Interval between `fastboot devices` polls while at least one
    /// fastboot listener is registered.
    pub fastboot_poll_interval_millis: u64,
    pub logging: LoggingConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            remote_control_bind_addr: "127.0.0.1:0".to_string(),
            default_retry_budget: 3,
            availability: AvailabilityRatios::default(),
            fastboot_poll_interval_millis: 3_000,
            logging: LoggingConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Load configuration: defaults, then `fleet.toml` at the workspace
    /// root if present, then `FLEET_`-prefixed environment variables.
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        if let Ok(workspace_root) = find_workspace_root() {
            let config_file = workspace_root.join("fleet.toml");
            if config_file.exists() {
                builder = builder.add_source(File::from(config_file));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("FLEET")
                .separator("_")
                .try_parsing(true),
        );

        let config = builder.build()?;
        let defaults = SchedulerConfig::default();

        Ok(SchedulerConfig {
            remote_control_bind_addr: config
                .get("remote_control_bind_addr")
                .unwrap_or(defaults.remote_control_bind_addr),
            default_retry_budget: config
                .get("default_retry_budget")
                .unwrap_or(defaults.default_retry_budget),
            availability: AvailabilityRatios {
                online_fraction: config
                    .get("availability.online_fraction")
                    .unwrap_or(defaults.availability.online_fraction),
                package_manager_fraction: config
                    .get("availability.package_manager_fraction")
                    .unwrap_or(defaults.availability.package_manager_fraction),
                storage_fraction: config
                    .get("availability.storage_fraction")
                    .unwrap_or(defaults.availability.storage_fraction),
                min_phase_millis: config
                    .get("availability.min_phase_millis")
                    .unwrap_or(defaults.availability.min_phase_millis),
                max_phase_millis: config
                    .get("availability.max_phase_millis")
                    .unwrap_or(defaults.availability.max_phase_millis),
            },
            fastboot_poll_interval_millis: config
                .get("fastboot_poll_interval_millis")
                .unwrap_or(defaults.fastboot_poll_interval_millis),
            logging: LoggingConfig {
                level: config.get("logging.level").unwrap_or(defaults.logging.level),
                file: config.get("logging.file").ok(),
                rotation: config.get("logging.rotation").ok(),
            },
        })
    }
}

/// Find the workspace root directory by looking for a Cargo.toml with `[workspace]`.
fn find_workspace_root() -> Result<PathBuf> {
    let mut current_dir = std::env::current_dir()?;

    loop {
        let cargo_toml = current_dir.join("Cargo.toml");
        if cargo_toml.exists() {
            let content = std::fs::read_to_string(&cargo_toml)?;
            if content.contains("[workspace]") {
                return Ok(current_dir);
            }
        }

        if let Some(parent) = current_dir.parent() {
            current_dir = parent.to_path_buf();
        } else {
            break;
        }
    }

    Err(SharedConfigError::Environment(
        "Could not find workspace root directory".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_sane() {
        let cfg = SchedulerConfig::default();
        assert_eq!(cfg.default_retry_budget, 3);
        assert!((cfg.availability.online_fraction
            + cfg.availability.package_manager_fraction
            + cfg.availability.storage_fraction
            - 1.0)
            .abs()
            < 1e-9);
    }

    #[test]
    fn load_falls_back_to_defaults_outside_a_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let cfg = SchedulerConfig::load().unwrap();
        std::env::set_current_dir(prev).unwrap();
        assert_eq!(cfg.remote_control_bind_addr, "127.0.0.1:0");
    }

    #[test]
    fn load_reads_fleet_toml_from_workspace_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.toml"), "[workspace]\nmembers = []\n").unwrap();
        let mut f = std::fs::File::create(dir.path().join("fleet.toml")).unwrap();
        writeln!(f, "default_retry_budget = 7").unwrap();

        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir.path()).unwrap();
        let cfg = SchedulerConfig::load().unwrap();
        std::env::set_current_dir(prev).unwrap();

        assert_eq!(cfg.default_retry_budget, 7);
    }
}
