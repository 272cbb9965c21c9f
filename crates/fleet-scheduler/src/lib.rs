//! # fleet-scheduler
//!
//! A device-fleet command scheduler: a priority queue of Commands matched
//! against a pool of Devices, with per-device recovery and a TCP
//! remote-control surface.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fleet_scheduler::device_manager::DeviceManager;
//! use fleet_scheduler::queue::CommandQueue;
//! use fleet_scheduler::scheduler::Scheduler;
//!
//! # fn build(bridge: Arc<dyn fleet_core::DebugBridge>, fastboot: Arc<dyn fleet_core::FastbootTransport>, invoker: Arc<dyn fleet_scheduler::scheduler::Invoker>, recovery_policy: Arc<dyn fleet_scheduler::recovery_policy::RecoveryPolicy>) {
//! let devices = DeviceManager::new(bridge, fastboot, Duration::from_secs(3));
//! let queue = Arc::new(CommandQueue::new());
//! let scheduler = Scheduler::new(queue, devices, invoker, recovery_policy, shared_config::SchedulerConfig::default());
//! scheduler.start();
//! # }
//! ```

pub mod command;
pub mod device_manager;
pub mod device_operation;
pub mod error;
pub mod logging;
pub mod queue;
pub mod recovery_policy;
pub mod remote_control;
pub mod scheduler;
pub mod state_monitor;
pub mod timer;

pub use command::{Command, CommandId, CommandOptions, ConfigurationHandle, Origin};
pub use error::{Result, SchedulerError};
pub use remote_control::RemoteControl;
pub use scheduler::{Invoker, Scheduler};
