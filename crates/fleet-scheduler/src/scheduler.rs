use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use fleet_core::{DeviceError, DeviceSelection, Disposition, FailureClass};
use shared_config::SchedulerConfig;
use tracing::{error, info, instrument, warn};

use crate::command::{Command, CommandId, CommandOptions};
use crate::device_manager::DeviceManager;
use crate::device_operation::execute_with_recovery;
use crate::error::{Result, SchedulerError};
use crate::queue::CommandQueue;
use crate::recovery_policy::RecoveryPolicy;
use crate::timer::TimerService;

/// One execution of a Command bound to a Device; external to the core (§6).
/// The caller supplies an implementation backed by the real adb/fastboot
/// transport; tests supply a stub that inspects its `args`.
pub trait Invoker: Send + Sync {
    /// Run `command` on `device_serial`. Call `reschedule` to enqueue a
    /// Rescheduled-Command referencing this invocation before returning.
    fn invoke(
        &self,
        command: &Command,
        device_serial: &str,
        reschedule: &mut dyn FnMut(Vec<String>),
    ) -> std::result::Result<(), DeviceError>;
}

/// Worker lifecycle states (§4.1): `CREATED -> STARTED -> (BLOCKED_ON_QUEUE |
/// RUNNING) -> FREED`. Rust has no portable cross-platform thread interrupt,
/// so `BLOCKED_ON_QUEUE` is approximated by a short-poll loop against
/// `shutdown` rather than a true interrupt (see DESIGN.md).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Created,
    Started,
    BlockedOnQueue,
    Running,
    Freed,
}

struct WorkerInfo {
    serial: String,
    phase: Mutex<WorkerPhase>,
}

/// Drives the fleet: harvests free Devices, spawns one Invocation Worker
/// thread per allocation, and runs the deferred-requeue timer (§4.1, §5).
pub struct Scheduler {
    queue: Arc<CommandQueue>,
    devices: Arc<DeviceManager>,
    invoker: Arc<dyn Invoker>,
    recovery_policy: Arc<dyn RecoveryPolicy>,
    timer: Arc<TimerService>,
    config: SchedulerConfig,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<(Arc<WorkerInfo>, JoinHandle<()>)>>,
    main_thread: Mutex<Option<JoinHandle<()>>>,
    timer_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        queue: Arc<CommandQueue>,
        devices: Arc<DeviceManager>,
        invoker: Arc<dyn Invoker>,
        recovery_policy: Arc<dyn RecoveryPolicy>,
        config: SchedulerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            devices,
            invoker,
            recovery_policy,
            timer: Arc::new(TimerService::new()),
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::new()),
            main_thread: Mutex::new(None),
            timer_thread: Mutex::new(None),
        })
    }

    /// Parse and enqueue `args` as a new root Command. Recognizes `-s
    /// <serial>`, `--loop` and `--min-loop-time <ms>`; everything else is
    /// passed through as the invocation's own argument vector.
    pub fn add_command(&self, args: Vec<String>) -> Result<CommandId> {
        let (selection, options, remaining) = parse_command_args(&args)?;
        let command = Command::new(remaining, selection, options);
        let id = command.id;
        self.queue.insert(command);
        Ok(id)
    }

    /// Remote-control `add_command;<ms>;<args...>` (§6): seeds the new
    /// Command's priority key with `seed_millis` instead of starting at zero.
    pub fn add_command_seeded(&self, seed_millis: u64, args: Vec<String>) -> CommandId {
        let command = Command::new(args, DeviceSelection::new(), CommandOptions::default());
        command.add_exec_time(Duration::from_millis(seed_millis));
        let id = command.id;
        self.queue.insert(command);
        id
    }

    pub fn list_queued(&self) -> Vec<Command> {
        self.queue.list_queued()
    }

    pub fn list_active(&self) -> Vec<(String, WorkerPhase)> {
        self.workers
            .lock()
            .unwrap()
            .iter()
            .map(|(info, _)| (info.serial.clone(), *info.phase.lock().unwrap()))
            .collect()
    }

    /// Start the main loop and timer threads. Call once.
    pub fn start(self: &Arc<Self>) {
        let timer = self.timer.clone();
        *self.timer_thread.lock().unwrap() = Some(std::thread::spawn(move || timer.run()));

        let scheduler = self.clone();
        *self.main_thread.lock().unwrap() = Some(std::thread::spawn(move || scheduler.main_loop()));
    }

    fn main_loop(self: &Arc<Self>) {
        info!("scheduler main loop started");
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.reap_finished_workers();
            match self
                .devices
                .allocate(Some(Duration::from_millis(500)), None)
            {
                Some(serial) => self.spawn_worker(serial),
                None => continue,
            }
        }
        info!("scheduler main loop exiting");
    }

    fn reap_finished_workers(&self) {
        self.workers
            .lock()
            .unwrap()
            .retain(|(_, handle)| !handle.is_finished());
    }

    fn spawn_worker(self: &Arc<Self>, serial: String) {
        let info = Arc::new(WorkerInfo {
            serial: serial.clone(),
            phase: Mutex::new(WorkerPhase::Created),
        });
        let scheduler = self.clone();
        let worker_info = info.clone();
        let handle = std::thread::spawn(move || scheduler.run_worker(serial, worker_info));
        self.workers.lock().unwrap().push((info, handle));
    }

    #[instrument(skip(self, info), fields(serial = %serial))]
    fn run_worker(self: &Arc<Self>, serial: String, info: Arc<WorkerInfo>) {
        *info.phase.lock().unwrap() = WorkerPhase::Started;

        let command = loop {
            *info.phase.lock().unwrap() = WorkerPhase::BlockedOnQueue;
            let matcher = |c: &Command| {
                self.devices
                    .device_snapshot(&serial)
                    .map(|d| c.selection.matches(&d))
                    .unwrap_or(false)
            };
            match self.queue.take(matcher, Some(Duration::from_millis(250))) {
                Some(c) => break Some(c),
                None => {
                    if self.shutdown.load(Ordering::SeqCst) {
                        break None;
                    }
                }
            }
        };

        let Some(command) = command else {
            *info.phase.lock().unwrap() = WorkerPhase::Freed;
            self.devices.free(&serial, Disposition::Available);
            return;
        };

        *info.phase.lock().unwrap() = WorkerPhase::Running;

        let loop_requeue = command.clone();
        let requeue_ids: Mutex<Vec<Vec<String>>> = Mutex::new(Vec::new());

        let start = Instant::now();
        let result = {
            let mut reschedule = |new_args: Vec<String>| {
                requeue_ids.lock().unwrap().push(new_args);
            };
            let mut invoke_once = || self.invoker.invoke(&command, &serial, &mut reschedule);
            // Every externally-visible device operation routes through the
            // retry-with-recovery wrapper (§4.4). Serials the manager has
            // never seen (shouldn't happen for an allocated device, but
            // cheaper to fall back than to unwrap) just invoke directly.
            match self.devices.recovery_context(&serial, self.recovery_policy.clone()) {
                Some(ctx) => execute_with_recovery(
                    &ctx,
                    "run invocation",
                    self.config.default_retry_budget,
                    invoke_once,
                ),
                None => invoke_once(),
            }
        };
        let elapsed = start.elapsed();
        command.add_exec_time(elapsed);

        for new_args in requeue_ids.into_inner().unwrap() {
            let rescheduled = command.reschedule_with(new_args, (*command.selection).clone());
            self.queue.insert(rescheduled);
        }

        if command.options.loop_mode && !self.shutdown.load(Ordering::SeqCst) {
            let queue = self.queue.clone();
            if command.options.min_loop_time.is_zero() {
                queue.insert(loop_requeue);
            } else {
                self.timer
                    .schedule(command.options.min_loop_time, move || queue.insert(loop_requeue));
            }
        }

        let disposition = match &result {
            Ok(()) => Disposition::Available,
            Err(err) => match err.classify() {
                FailureClass::Gone => Disposition::Unavailable,
                FailureClass::Wedged => Disposition::Unresponsive,
                FailureClass::Fatal => {
                    error!(error = %err, "fatal error, triggering scheduler shutdown");
                    self.trigger_fatal_shutdown();
                    Disposition::Available
                }
                FailureClass::Transient | FailureClass::Logic => {
                    warn!(error = %err, "invocation failed, freeing device as available");
                    Disposition::Available
                }
            },
        };

        *info.phase.lock().unwrap() = WorkerPhase::Freed;
        self.devices.free(&serial, disposition);
    }

    fn trigger_fatal_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.close();
        self.timer.cancel();
        self.devices.terminate();
    }

    /// Graceful shutdown (§5): close the queue, cancel the timer, let
    /// `BLOCKED_ON_QUEUE` workers observe `shutdown` on their next poll and
    /// free their device, let `RUNNING` workers finish their invocation, then
    /// join everyone.
    pub fn shutdown(&self) {
        info!("scheduler graceful shutdown requested");
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.close();
        self.timer.cancel();
        self.devices.terminate();
        self.join_all();
    }

    /// `shutdown()` plus a forced transport termination, even if a device is
    /// wedged mid-invocation.
    pub fn shutdown_hard(&self) {
        warn!("scheduler hard shutdown requested");
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue.close();
        self.timer.cancel();
        self.devices.terminate_hard();
        self.join_all();
    }

    fn join_all(&self) {
        if let Some(handle) = self.main_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.timer_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for (_, handle) in workers {
            let _ = handle.join();
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
}

fn parse_command_args(args: &[String]) -> Result<(DeviceSelection, CommandOptions, Vec<String>)> {
    let mut selection = DeviceSelection::new();
    let mut options = CommandOptions::default();
    let mut remaining = Vec::new();

    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-s" => {
                let serial = iter.next().ok_or_else(|| {
                    SchedulerError::Validation("-s requires a serial argument".to_string())
                })?;
                selection.serials.insert(serial.clone());
            }
            "--loop" => options.loop_mode = true,
            "--min-loop-time" => {
                let raw = iter.next().ok_or_else(|| {
                    SchedulerError::Validation("--min-loop-time requires a millisecond value".to_string())
                })?;
                let millis: u64 = raw.parse().map_err(|_| {
                    SchedulerError::Validation(format!("invalid --min-loop-time value: {raw}"))
                })?;
                options.min_loop_time = Duration::from_millis(millis);
            }
            "--all-devices" => options.all_devices = true,
            "--dry-run" => options.dry_run = true,
            other => remaining.push(other.to_string()),
        }
    }

    Ok((selection, options, remaining))
}
