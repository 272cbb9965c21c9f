use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_core::DeviceSelection;
use uuid::Uuid;

/// Identifies a Command for the lifetime of the process. Never persisted
/// (the queue does not survive a restart — see non-goals).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId(Uuid);

impl CommandId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for CommandId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Loop/repeat and presentation options recognized on a Command.
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub loop_mode: bool,
    pub min_loop_time: Duration,
    pub help: bool,
    pub dry_run: bool,
    pub all_devices: bool,
}

/// Opaque per-invocation configuration. The core never interprets its
/// contents (non-goal: it does not own a configuration schema for tests) —
/// it only guarantees R1: deriving it twice from the same `args` is
/// deterministic, which is why it is never stored and always recomputed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationHandle(Vec<String>);

impl ConfigurationHandle {
    pub fn derive(args: &[String]) -> Self {
        ConfigurationHandle(args.to_vec())
    }

    pub fn args(&self) -> &[String] {
        &self.0
    }
}

/// Distinguishes a root Command from one produced by a running invocation's
/// rescheduler callback. The originator is referenced by id, not by an
/// owning pointer, so a Rescheduled-Command never keeps its originator's
/// queue entry alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Root,
    Rescheduled { originator: CommandId },
}

/// A queued unit of work (§3). A Rescheduled-Command is represented as a
/// `Command` whose `origin` is `Origin::Rescheduled` and whose
/// `total_exec_time` is shared (via `Arc`) with its originator, so
/// elapsed invocation time always accrues on the true originator's key
/// (P3) regardless of which instance is currently running.
#[derive(Debug, Clone)]
pub struct Command {
    pub id: CommandId,
    pub args: Vec<String>,
    pub selection: Arc<DeviceSelection>,
    pub options: CommandOptions,
    pub origin: Origin,
    total_exec_time_millis: Arc<AtomicU64>,
}

impl Command {
    pub fn new(args: Vec<String>, selection: DeviceSelection, options: CommandOptions) -> Self {
        Self {
            id: CommandId::new(),
            args,
            selection: Arc::new(selection),
            options,
            origin: Origin::Root,
            total_exec_time_millis: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Re-derive this Command's configuration from its immutable `args`
    /// (invariant R1). Never cached: calling this twice always succeeds
    /// identically for an unchanged `args`.
    pub fn configuration(&self) -> ConfigurationHandle {
        ConfigurationHandle::derive(&self.args)
    }

    pub fn total_exec_time(&self) -> Duration {
        Duration::from_millis(self.total_exec_time_millis.load(Ordering::SeqCst))
    }

    /// Accumulate elapsed invocation time onto this Command's priority key.
    /// If this Command is itself a Rescheduled-Command, the shared atomic
    /// means the time lands on the originator's key too (P3).
    pub fn add_exec_time(&self, elapsed: Duration) {
        self.total_exec_time_millis
            .fetch_add(elapsed.as_millis() as u64, Ordering::SeqCst);
    }

    /// The originator this Command's accounting accrues to: itself for a
    /// root Command, or the referenced originator for a Rescheduled one.
    pub fn originator_id(&self) -> CommandId {
        match self.origin {
            Origin::Root => self.id,
            Origin::Rescheduled { originator } => originator,
        }
    }

    /// Construct the Rescheduled-Command an in-flight invocation asked for
    /// via the rescheduler callback (§4.1): never loop-mode, sharing this
    /// Command's time accounting.
    pub fn reschedule_with(&self, new_args: Vec<String>, selection: DeviceSelection) -> Command {
        Command {
            id: CommandId::new(),
            args: new_args,
            selection: Arc::new(selection),
            options: CommandOptions {
                loop_mode: false,
                ..self.options.clone()
            },
            origin: Origin::Rescheduled {
                originator: self.originator_id(),
            },
            total_exec_time_millis: self.total_exec_time_millis.clone(),
        }
    }
}
