//! Worker Supervisor - health probe and bounded auto-restart.
//!
//! The worker is an opaque child process with its own lifetime. The
//! supervisor probes its socket, spawns it when down, waits for
//! readiness, and throttles after repeated failed restarts. It never
//! runs inference itself.

use std::net::{TcpStream, ToSocketAddrs};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{AgentError, Result};
use crate::structured_log::{log_event, LogLevel};

pub const CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const READY_TIMEOUT: Duration = Duration::from_secs(60);
pub const MAX_RESTART_ATTEMPTS: u32 = 3;
const THROTTLE_PAUSE: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct SupervisorConfig {
    pub host: String,
    pub port: u16,
    /// Command line used to spawn the worker process.
    pub worker_cmd: String,
    pub worker_args: Vec<String>,
    pub check_interval: Duration,
}

impl SupervisorConfig {
    pub fn new(host: &str, port: u16, worker_cmd: &str, worker_args: Vec<String>) -> Self {
        Self {
            host: host.to_string(),
            port,
            worker_cmd: worker_cmd.to_string(),
            worker_args,
            check_interval: CHECK_INTERVAL,
        }
    }
}

pub struct WorkerSupervisor {
    config: SupervisorConfig,
    child: Arc<Mutex<Option<Child>>>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            child: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
        }
    }

    /// 2 s TCP connect probe.
    pub fn is_worker_alive(&self) -> bool {
        probe(&self.config.host, self.config.port)
    }

    fn spawn_worker(&self) -> Result<()> {
        eprintln!("[Supervisor] starting worker: {}", self.config.worker_cmd);

        let child = Command::new(&self.config.worker_cmd)
            .args(&self.config.worker_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                AgentError::IpcUnavailable(format!(
                    "cannot spawn {}: {}",
                    self.config.worker_cmd, e
                ))
            })?;

        *self.child.lock().unwrap() = Some(child);
        Ok(())
    }

    fn wait_for_worker(&self, timeout: Duration) -> bool {
        let started = Instant::now();
        while started.elapsed() < timeout {
            if self.is_worker_alive() {
                return true;
            }
            std::thread::sleep(Duration::from_secs(1));
        }
        false
    }

    /// Make sure a worker is reachable; spawns one if not. Called before
    /// the first model request.
    pub fn ensure_running(&self) -> Result<()> {
        if self.is_worker_alive() {
            return Ok(());
        }

        self.spawn_worker()?;
        if self.wait_for_worker(READY_TIMEOUT) {
            log_event(
                LogLevel::Info,
                "SUPERVISOR",
                "worker_ready",
                serde_json::json!({"port": self.config.port}),
            );
            Ok(())
        } else {
            self.kill_child();
            Err(AgentError::IpcUnavailable(format!(
                "worker did not become ready within {}s",
                READY_TIMEOUT.as_secs()
            )))
        }
    }

    fn kill_child(&self) {
        if let Some(mut child) = self.child.lock().unwrap().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    /// Continuous monitor loop with bounded restarts.
    pub fn start_monitor(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let config = self.config.clone();
        let child_slot = self.child.clone();
        let running = self.running.clone();

        let handle = std::thread::spawn(move || {
            let mut restart_count: u32 = 0;

            while running.load(Ordering::SeqCst) {
                if probe(&config.host, config.port) {
                    restart_count = 0;
                } else {
                    if restart_count >= MAX_RESTART_ATTEMPTS {
                        log_event(
                            LogLevel::Error,
                            "SUPERVISOR",
                            "restart_throttled",
                            serde_json::json!({"attempts": restart_count}),
                        );
                        sleep_while(&running, THROTTLE_PAUSE);
                        restart_count = 0;
                        continue;
                    }

                    eprintln!(
                        "[Supervisor] worker is down (restart #{})",
                        restart_count + 1
                    );

                    let spawned = Command::new(&config.worker_cmd)
                        .args(&config.worker_args)
                        .stdin(Stdio::null())
                        .stdout(Stdio::null())
                        .stderr(Stdio::inherit())
                        .spawn();

                    match spawned {
                        Ok(child) => {
                            *child_slot.lock().unwrap() = Some(child);
                            let ready = {
                                let started = Instant::now();
                                loop {
                                    if probe(&config.host, config.port) {
                                        break true;
                                    }
                                    if started.elapsed() >= READY_TIMEOUT
                                        || !running.load(Ordering::SeqCst)
                                    {
                                        break false;
                                    }
                                    std::thread::sleep(Duration::from_secs(1));
                                }
                            };

                            if ready {
                                eprintln!("[Supervisor] worker restarted");
                                restart_count = 0;
                            } else {
                                restart_count += 1;
                            }
                        }
                        Err(e) => {
                            eprintln!("[Supervisor] spawn failed: {}", e);
                            restart_count += 1;
                        }
                    }
                }

                sleep_while(&running, config.check_interval);
            }
        });

        *self.handle.lock().unwrap() = Some(handle);
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.kill_child();
    }
}

impl Drop for WorkerSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn probe(host: &str, port: u16) -> bool {
    let addrs = match format!("{}:{}", host, port).to_socket_addrs() {
        Ok(addrs) => addrs,
        Err(_) => return false,
    };
    for addr in addrs {
        if TcpStream::connect_timeout(&addr, Duration::from_secs(2)).is_ok() {
            return true;
        }
    }
    false
}

fn sleep_while(running: &AtomicBool, duration: Duration) {
    let slices = 10u32;
    for _ in 0..slices {
        if !running.load(Ordering::SeqCst) {
            return;
        }
        std::thread::sleep(duration / slices);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_probe_detects_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(probe("127.0.0.1", port));
        drop(listener);
        assert!(!probe("127.0.0.1", port));
    }

    #[test]
    fn test_alive_check_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let supervisor = WorkerSupervisor::new(SupervisorConfig::new(
            "127.0.0.1",
            port,
            "true",
            vec![],
        ));
        assert!(supervisor.is_worker_alive());
    }

    #[test]
    fn test_ensure_running_short_circuits_when_alive() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let supervisor = WorkerSupervisor::new(SupervisorConfig::new(
            "127.0.0.1",
            port,
            "definitely-not-a-real-binary",
            vec![],
        ));

        // Reachable socket means no spawn attempt is made at all
        assert!(supervisor.ensure_running().is_ok());
    }
}
