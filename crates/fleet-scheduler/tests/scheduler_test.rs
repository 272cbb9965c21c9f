use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fleet_core::{
    BridgeEventListener, DebugBridge, DeviceError, DeviceState, FastbootResult, FastbootTransport,
    ShellResult,
};
use fleet_scheduler::command::Command;
use fleet_scheduler::device_manager::DeviceManager;
use fleet_scheduler::queue::CommandQueue;
use fleet_scheduler::recovery_policy::DefaultRecoveryPolicy;
use fleet_scheduler::scheduler::{Invoker, Scheduler};

struct FixedBridge {
    listener: Mutex<Option<Box<dyn BridgeEventListener>>>,
    devices: Vec<(String, DeviceState)>,
}

impl FixedBridge {
    fn new(devices: Vec<(&str, DeviceState)>) -> Arc<Self> {
        Arc::new(Self {
            listener: Mutex::new(None),
            devices: devices
                .into_iter()
                .map(|(s, st)| (s.to_string(), st))
                .collect(),
        })
    }
}

impl DebugBridge for FixedBridge {
    fn list_devices(&self) -> Result<Vec<(String, DeviceState)>, DeviceError> {
        Ok(self.devices.clone())
    }
    fn subscribe(&self, listener: Box<dyn BridgeEventListener>) -> u64 {
        *self.listener.lock().unwrap() = Some(listener);
        1
    }
    fn unsubscribe(&self, _subscription_id: u64) {}
    fn shell(&self, _: &str, _: &str, _: Duration) -> Result<ShellResult, DeviceError> {
        unimplemented!()
    }
    fn push(&self, _: &str, _: &str, _: &str) -> Result<(), DeviceError> {
        unimplemented!()
    }
    fn pull(&self, _: &str, _: &str, _: &str) -> Result<(), DeviceError> {
        unimplemented!()
    }
    fn install(&self, _: &str, _: &str) -> Result<(), DeviceError> {
        unimplemented!()
    }
    fn uninstall(&self, _: &str, _: &str) -> Result<(), DeviceError> {
        unimplemented!()
    }
    fn reboot(&self, _: &str, _: &str) -> Result<(), DeviceError> {
        unimplemented!()
    }
    fn get_properties(&self, _: &str) -> Result<HashMap<String, String>, DeviceError> {
        Ok(HashMap::new())
    }
    fn force_disconnect(&self) {}
}

struct NoopFastboot;
impl FastbootTransport for NoopFastboot {
    fn run(&self, _: &str, _: &[String], _: Duration) -> Result<FastbootResult, DeviceError> {
        unimplemented!()
    }
    fn list_devices(&self) -> Result<Vec<String>, DeviceError> {
        Ok(Vec::new())
    }
}

/// Records the order in which commands were invoked and their bound serial.
struct RecordingInvoker {
    order: Mutex<Vec<(String, Vec<String>)>>,
    run_time: Duration,
}

impl RecordingInvoker {
    fn new(run_time: Duration) -> Arc<Self> {
        Arc::new(Self {
            order: Mutex::new(Vec::new()),
            run_time,
        })
    }
}

impl Invoker for RecordingInvoker {
    fn invoke(
        &self,
        command: &Command,
        device_serial: &str,
        _reschedule: &mut dyn FnMut(Vec<String>),
    ) -> Result<(), DeviceError> {
        self.order
            .lock()
            .unwrap()
            .push((device_serial.to_string(), command.args.clone()));
        std::thread::sleep(self.run_time);
        Ok(())
    }
}

fn harness(invoker: Arc<dyn Invoker>, devices: Vec<(&str, DeviceState)>) -> (Arc<Scheduler>, Arc<DeviceManager>) {
    let bridge = FixedBridge::new(devices);
    let devices = DeviceManager::new(bridge, Arc::new(NoopFastboot), Duration::from_secs(3600));
    let queue = Arc::new(CommandQueue::new());
    let recovery_policy = Arc::new(DefaultRecoveryPolicy::default());
    let scheduler = Scheduler::new(queue, devices.clone(), invoker, recovery_policy, shared_config::SchedulerConfig::default());
    (scheduler, devices)
}

#[test]
fn lower_total_exec_time_commands_run_first() {
    let invoker = RecordingInvoker::new(Duration::from_millis(20));
    let (scheduler, _devices) = harness(invoker.clone(), vec![("S1", DeviceState::Online)]);

    assert!(scheduler.list_queued().is_empty());
    scheduler.add_command_seeded(500, vec!["a".to_string()]);
    scheduler.add_command(vec!["b".to_string()]).unwrap();

    scheduler.start();
    std::thread::sleep(Duration::from_millis(400));
    scheduler.shutdown();

    let order = invoker.order.lock().unwrap();
    let args: Vec<_> = order.iter().map(|(_, args)| args.clone()).collect();
    assert_eq!(args.first(), Some(&vec!["b".to_string()]));
}

#[test]
fn loop_mode_waits_min_loop_time_between_runs() {
    let invoker = RecordingInvoker::new(Duration::from_millis(10));
    let (scheduler, _devices) = harness(invoker.clone(), vec![("S1", DeviceState::Online)]);

    scheduler
        .add_command(vec![
            "--loop".to_string(),
            "--min-loop-time".to_string(),
            "150".to_string(),
            "ping".to_string(),
        ])
        .unwrap();

    scheduler.start();
    std::thread::sleep(Duration::from_millis(500));
    scheduler.shutdown();

    let order = invoker.order.lock().unwrap();
    assert!(order.len() >= 2, "expected at least two loop iterations, got {}", order.len());
    assert!(order.len() <= 4, "loop ran suspiciously often: {}", order.len());
}

#[test]
fn device_specific_selection_does_not_block_the_general_queue() {
    let invoker = RecordingInvoker::new(Duration::from_millis(20));
    let (scheduler, _devices) = harness(
        invoker.clone(),
        vec![("S1", DeviceState::Online), ("S2", DeviceState::Online)],
    );

    scheduler.add_command(vec!["-s".to_string(), "S1".to_string(), "only-s1".to_string()]).unwrap();
    scheduler.add_command(vec!["general".to_string()]).unwrap();

    scheduler.start();
    std::thread::sleep(Duration::from_millis(300));
    scheduler.shutdown();

    let order = invoker.order.lock().unwrap();
    assert_eq!(order.len(), 2);
}

#[test]
fn fatal_error_triggers_shutdown() {
    struct FatalInvoker(AtomicUsize);
    impl Invoker for FatalInvoker {
        fn invoke(
            &self,
            _command: &Command,
            _device_serial: &str,
            _reschedule: &mut dyn FnMut(Vec<String>),
        ) -> Result<(), DeviceError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(DeviceError::FatalHost("host process is unusable".to_string()))
        }
    }

    let invoker = Arc::new(FatalInvoker(AtomicUsize::new(0)));
    let (scheduler, _devices) = harness(invoker.clone(), vec![("S1", DeviceState::Online)]);
    scheduler.add_command(vec!["boom".to_string()]).unwrap();
    scheduler.start();

    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(invoker.0.load(Ordering::SeqCst), 1);
    scheduler.shutdown();
}
