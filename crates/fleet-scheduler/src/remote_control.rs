use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::device_manager::DeviceManager;
use crate::scheduler::Scheduler;

/// TCP line-protocol remote control (§6). One connection at a time; each
/// line is one verb, answered with a single line reply.
///
/// Verbs:
/// - `filter;<serial>` -> `true`/`false` (force-allocate the device)
/// - `unfilter;<serial>` / `unfilter;*` -> `true`
/// - `add_command;<ms>;<args...>` -> the new Command's id
/// - `close` -> closes the connection
/// - anything else -> `false`
pub struct RemoteControl {
    devices: Arc<DeviceManager>,
    scheduler: Arc<Scheduler>,
    bound_port: AtomicU16,
    bound: Mutex<bool>,
    bound_cond: Condvar,
    shutdown: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteControl {
    pub fn new(devices: Arc<DeviceManager>, scheduler: Arc<Scheduler>) -> Arc<Self> {
        Arc::new(Self {
            devices,
            scheduler,
            bound_port: AtomicU16::new(0),
            bound: Mutex::new(false),
            bound_cond: Condvar::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        })
    }

    /// Bind to `bind_addr` (port 0 for an ephemeral port) and start serving.
    pub fn start(self: &Arc<Self>, bind_addr: &str) -> std::io::Result<()> {
        let listener = TcpListener::bind(bind_addr)?;
        let port = listener.local_addr()?.port();
        self.bound_port.store(port, Ordering::SeqCst);
        {
            let mut bound = self.bound.lock().unwrap();
            *bound = true;
        }
        self.bound_cond.notify_all();
        info!(port, "remote control listening");

        let rc = self.clone();
        *self.thread.lock().unwrap() = Some(std::thread::spawn(move || rc.accept_loop(listener)));
        Ok(())
    }

    /// Block (up to 10s) until the listener has bound, then return its port.
    pub fn port(&self) -> Option<u16> {
        let mut bound = self.bound.lock().unwrap();
        let deadline = Duration::from_secs(10);
        while !*bound {
            let (guard, result) = self.bound_cond.wait_timeout(bound, deadline).unwrap();
            bound = guard;
            if result.timed_out() && !*bound {
                return None;
            }
        }
        Some(self.bound_port.load(Ordering::SeqCst))
    }

    fn accept_loop(&self, listener: TcpListener) {
        listener
            .set_nonblocking(true)
            .expect("setting non-blocking on remote control listener");
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            match listener.accept() {
                Ok((stream, addr)) => {
                    debug!(%addr, "remote control client connected");
                    stream
                        .set_nonblocking(false)
                        .expect("clearing non-blocking on accepted stream");
                    self.serve_client(stream);
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    warn!(error = %e, "remote control accept failed");
                    return;
                }
            }
        }
    }

    fn serve_client(&self, stream: TcpStream) {
        let mut reader = BufReader::new(stream.try_clone().expect("cloning client stream"));
        let mut writer = stream;
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => return,
                Ok(_) => {
                    let reply = self.handle_line(line.trim_end());
                    if writeln!(writer, "{reply}").is_err() {
                        return;
                    }
                    if line.trim_end() == "close" {
                        return;
                    }
                }
                Err(_) => return,
            }
        }
    }

    fn handle_line(&self, line: &str) -> String {
        let parts: Vec<&str> = line.split(';').collect();
        match parts.as_slice() {
            ["filter", serial] => self.devices.force_allocate(serial).to_string(),
            ["unfilter", "*"] => {
                self.devices.release_filter(None);
                "true".to_string()
            }
            ["unfilter", serial] => {
                self.devices.release_filter(Some(serial));
                "true".to_string()
            }
            ["add_command", ms, rest @ ..] => match ms.parse::<u64>() {
                Ok(millis) => {
                    let args: Vec<String> = rest.iter().map(|s| s.to_string()).collect();
                    let _id = self.scheduler.add_command_seeded(millis, args);
                    "true".to_string()
                }
                Err(_) => "false".to_string(),
            },
            ["close"] => {
                // Closes this session and terminates the listener (§6): the
                // accept loop observes `shutdown` on its next poll.
                self.shutdown.store(true, Ordering::SeqCst);
                "true".to_string()
            }
            _ => "false".to_string(),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}
