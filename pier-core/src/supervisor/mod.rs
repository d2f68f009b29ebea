// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Process supervision for piers.
//!
//! Spawns the OS process behind a pier, waits for it to become ready,
//! stops it (gracefully, then forcefully) and reports unexpected exits
//! exactly once. Restart decisions are left to the caller.

mod output;
mod process;

use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use tokio::process::Command;
use tokio::task::JoinSet;

use crate::config::{ReadinessConfig, ReadinessMode};
use crate::error::SupervisorError;
use crate::state::ProcessState;
use crate::types::PierId;

pub use output::{OutputBuffer, OutputLine, OutputStream};
pub use process::{ExitInfo, ExitKind, ExitNotification, ExitReceiver, LaunchSpec, ProcessHandle};

/// Marks a pier as having a spawn or stop in flight; cleared on drop.
struct BusyGuard<'a> {
    busy: &'a DashMap<PierId, ()>,
    pier_id: PierId,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.busy.remove(&self.pier_id);
    }
}

/// Owns every live pier process.
#[derive(Debug)]
pub struct ProcessSupervisor {
    live: Arc<DashMap<PierId, ProcessHandle>>,
    busy: DashMap<PierId, ()>,
    outputs: DashMap<PierId, Arc<OutputBuffer>>,
    output_lines: usize,
}

impl ProcessSupervisor {
    /// Create a supervisor keeping `output_lines` lines of output per pier.
    pub fn new(output_lines: usize) -> Self {
        Self {
            live: Arc::new(DashMap::new()),
            busy: DashMap::new(),
            outputs: DashMap::new(),
            output_lines,
        }
    }

    fn claim(&self, pier_id: &PierId) -> Result<BusyGuard<'_>, SupervisorError> {
        match self.busy.entry(pier_id.clone()) {
            Entry::Occupied(_) => Err(SupervisorError::Busy),
            Entry::Vacant(slot) => {
                slot.insert(());
                Ok(BusyGuard {
                    busy: &self.busy,
                    pier_id: pier_id.clone(),
                })
            }
        }
    }

    /// Launch a pier process and wait until it is ready.
    ///
    /// On success the process is `Running` and the returned receiver will
    /// carry its single exit notification. A process that exits while
    /// booting fails the call with `ExitedDuringBoot`; one that is still not
    /// ready after `startup_timeout` is stopped and fails with `ReadyTimeout`.
    pub async fn spawn(
        &self,
        spec: LaunchSpec,
        readiness: ReadinessConfig,
        startup_timeout: Duration,
        stop_timeout: Duration,
    ) -> Result<(ProcessHandle, ExitReceiver), SupervisorError> {
        let _guard = self.claim(&spec.pier_id)?;

        if self.live.contains_key(&spec.pier_id) {
            return Err(SupervisorError::AlreadyLive);
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .env("PIER_ID", spec.pier_id.as_str())
            .env("PIER_DIR", &spec.directory)
            .env("PIER_WEB_PORT", spec.ports.web.to_string())
            .env("PIER_LOOPBACK_PORT", spec.ports.loopback.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| SupervisorError::SpawnFailed {
            program: spec.program.display().to_string(),
            reason: e.to_string(),
        })?;

        let output = Arc::new(OutputBuffer::new(self.output_lines));
        self.outputs
            .insert(spec.pier_id.clone(), Arc::clone(&output));

        let (handle, exit_rx) =
            process::supervise(spec.pier_id.clone(), child, output, Arc::clone(&self.live))?;

        tracing::info!(
            pier_id = %spec.pier_id,
            pid = %handle.pid(),
            program = %spec.program.display(),
            web_port = %spec.ports.web,
            loopback_port = %spec.ports.loopback,
            "Spawned pier process"
        );

        match await_ready(&handle, spec.ports.web.value(), readiness, startup_timeout).await {
            Ok(()) => {
                tracing::info!(
                    pier_id = %spec.pier_id,
                    pid = %handle.pid(),
                    elapsed_ms = handle.uptime().as_millis() as u64,
                    "Pier process ready"
                );
                Ok((handle, exit_rx))
            }
            Err(e @ SupervisorError::ReadyTimeout { .. }) => {
                tracing::warn!(pier_id = %spec.pier_id, pid = %handle.pid(), "Pier never became ready, stopping it");
                // The process may exit on its own meanwhile; either way it is gone.
                let _ = handle.request_stop(stop_timeout).await;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    /// Stop the live process of `pier_id`, escalating to SIGKILL after
    /// `timeout`.
    pub async fn stop(
        &self,
        pier_id: &PierId,
        timeout: Duration,
    ) -> Result<ExitNotification, SupervisorError> {
        let _guard = self.claim(pier_id)?;

        let handle = self
            .live
            .get(pier_id)
            .map(|h| h.clone())
            .ok_or(SupervisorError::NotLive)?;

        handle.request_stop(timeout).await
    }

    /// Stop every live process concurrently, each bounded by `timeout`.
    /// Returns how many processes were stopped.
    pub async fn stop_all(&self, timeout: Duration) -> usize {
        let handles: Vec<ProcessHandle> = self.live.iter().map(|h| h.value().clone()).collect();
        let mut set = JoinSet::new();

        for handle in handles {
            set.spawn(async move { handle.request_stop(timeout).await });
        }

        let mut stopped = 0;
        while let Some(res) = set.join_next().await {
            if matches!(res, Ok(Ok(_))) {
                stopped += 1;
            }
        }
        stopped
    }

    pub fn is_live(&self, pier_id: &PierId) -> bool {
        self.live.contains_key(pier_id)
    }

    /// Captured output of the most recent process of `pier_id`, or only its
    /// last `limit` lines. Kept after exit so a crash can be diagnosed.
    pub fn output(&self, pier_id: &PierId, limit: Option<usize>) -> Option<Vec<OutputLine>> {
        self.outputs.get(pier_id).map(|b| match limit {
            Some(n) => b.tail(n),
            None => b.snapshot(),
        })
    }

    /// Drop the captured output of a pier that no longer exists.
    pub fn forget(&self, pier_id: &PierId) {
        self.outputs.remove(pier_id);
    }
}

async fn await_ready(
    handle: &ProcessHandle,
    web_port: u16,
    readiness: ReadinessConfig,
    timeout: Duration,
) -> Result<(), SupervisorError> {
    let ready = async {
        match readiness.mode {
            ReadinessMode::Port => loop {
                if tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, web_port))
                    .await
                    .is_ok()
                {
                    break;
                }
                tokio::time::sleep(readiness.poll_interval).await;
            },
            ReadinessMode::Grace => tokio::time::sleep(readiness.grace).await,
        }
    };

    tokio::select! {
        biased;
        info = handle.exited() => {
            return Err(SupervisorError::ExitedDuringBoot { status: info.to_string() });
        }
        _ = ready => {}
        _ = tokio::time::sleep(timeout) => {
            return Err(SupervisorError::ReadyTimeout { timeout_ms: timeout.as_millis() as u64 });
        }
    }

    // The monitor may have recorded a crash between readiness and now.
    match handle.transition(ProcessState::Running) {
        Ok(()) => Ok(()),
        Err(_) => {
            let info = handle.exited().await;
            Err(SupervisorError::ExitedDuringBoot {
                status: info.to_string(),
            })
        }
    }
}

/// Whether a process with `pid` exists.
pub fn probe_pid(pid: u32) -> bool {
    match process::send_signal_probe(pid) {
        Ok(()) => true,
        // Exists, owned by someone else.
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Whether `pid` is alive and was launched for `pier_id`.
///
/// Pier processes carry `PIER_ID` in their environment, which guards against
/// a recycled pid. Without procfs access this degrades to [`probe_pid`].
pub fn pid_belongs_to(pid: u32, pier_id: &PierId) -> bool {
    if !probe_pid(pid) {
        return false;
    }

    let marker = format!("PIER_ID={}", pier_id);
    match std::fs::read(format!("/proc/{}/environ", pid)) {
        Ok(environ) => environ
            .split(|b| *b == 0)
            .any(|var| var == marker.as_bytes()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(_) => true,
    }
}

/// Stop a process we hold no handle for: SIGTERM, poll until gone, SIGKILL
/// after `timeout`. Returns true when SIGKILL was needed.
pub async fn terminate_pid(pid: u32, timeout: Duration) -> Result<bool, SupervisorError> {
    process::send_signal(pid, Signal::SIGTERM)?;

    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !probe_pid(pid) {
            return Ok(false);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    if probe_pid(pid) {
        process::send_signal(pid, Signal::SIGKILL)?;
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    use crate::types::{Port, PortPair};

    fn readiness_grace(ms: u64) -> ReadinessConfig {
        ReadinessConfig {
            mode: ReadinessMode::Grace,
            grace: Duration::from_millis(ms),
            poll_interval: Duration::from_millis(20),
        }
    }

    fn shell_spec(name: &str, script: &str) -> LaunchSpec {
        LaunchSpec {
            pier_id: PierId::new(name).unwrap(),
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            directory: std::env::temp_dir(),
            ports: PortPair::new(Port::new(18080).unwrap(), Port::new(22321).unwrap()).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_spawn_and_stop() {
        let sup = ProcessSupervisor::new(50);
        let spec = shell_spec("zod", "echo booting; exec sleep 30");

        let (handle, exit_rx) = sup
            .spawn(spec, readiness_grace(100), Duration::from_secs(5), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(handle.state(), ProcessState::Running);
        assert!(sup.is_live(handle.pier_id()));

        let note = sup.stop(handle.pier_id(), Duration::from_secs(2)).await.unwrap();
        assert_eq!(note.kind, ExitKind::Requested);
        assert!(!note.forced);

        // The exit channel sees the same single notification.
        let delivered = exit_rx.await.unwrap();
        assert_eq!(delivered, note);
        assert!(!sup.is_live(handle.pier_id()));

        let output = sup.output(handle.pier_id(), None).unwrap();
        assert!(output.iter().any(|l| l.line == "booting"));
    }

    #[tokio::test]
    async fn test_crash_reported_once() {
        let sup = ProcessSupervisor::new(50);
        let spec = shell_spec("bus", "sleep 0.3; exit 3");

        let (handle, exit_rx) = sup
            .spawn(spec, readiness_grace(50), Duration::from_secs(5), Duration::from_secs(2))
            .await
            .unwrap();

        let note = exit_rx.await.unwrap();
        assert_eq!(note.kind, ExitKind::Crashed);
        assert_eq!(note.info.code, Some(3));
        assert_eq!(handle.state(), ProcessState::Crashed);

        // Stopping a crashed process finds nothing to stop.
        let err = sup.stop(handle.pier_id(), Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SupervisorError::NotLive));
    }

    #[tokio::test]
    async fn test_exit_during_boot_fails_spawn() {
        let sup = ProcessSupervisor::new(50);
        let spec = shell_spec("nec", "exit 7");

        let err = sup
            .spawn(spec, readiness_grace(2_000), Duration::from_secs(5), Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            SupervisorError::ExitedDuringBoot { status } => assert!(status.contains('7')),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ready_timeout_stops_process() {
        let sup = ProcessSupervisor::new(50);
        let spec = shell_spec("wet", "exec sleep 30");
        let id = spec.pier_id.clone();

        let port_mode = ReadinessConfig {
            mode: ReadinessMode::Port,
            grace: Duration::from_millis(0),
            poll_interval: Duration::from_millis(20),
        };
        let err = sup
            .spawn(spec, port_mode, Duration::from_millis(200), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ReadyTimeout { .. }));
        assert!(!sup.is_live(&id));
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let sup = ProcessSupervisor::new(50);
        let spec = shell_spec("mex", "trap '' TERM; while true; do sleep 0.1; done");

        let (handle, _exit_rx) = sup
            .spawn(spec, readiness_grace(100), Duration::from_secs(5), Duration::from_secs(1))
            .await
            .unwrap();

        let note = sup.stop(handle.pier_id(), Duration::from_millis(300)).await.unwrap();
        assert!(note.forced);
        assert_eq!(note.info.signal, Some(9));
    }

    #[tokio::test]
    async fn test_second_spawn_rejected() {
        let sup = ProcessSupervisor::new(50);
        let (handle, _rx) = sup
            .spawn(
                shell_spec("lur", "exec sleep 30"),
                readiness_grace(50),
                Duration::from_secs(5),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        let err = sup
            .spawn(
                shell_spec("lur", "exec sleep 30"),
                readiness_grace(50),
                Duration::from_secs(5),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyLive));

        assert_eq!(sup.stop_all(Duration::from_secs(1)).await, 1);
        assert!(!sup.is_live(handle.pier_id()));
    }

    #[tokio::test]
    async fn test_concurrent_spawn_same_pier_is_busy() {
        let sup = Arc::new(ProcessSupervisor::new(50));

        let slow = {
            let sup = Arc::clone(&sup);
            tokio::spawn(async move {
                sup.spawn(
                    shell_spec("pel", "exec sleep 30"),
                    readiness_grace(400),
                    Duration::from_secs(5),
                    Duration::from_secs(1),
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let err = sup
            .stop(&PierId::new("pel").unwrap(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Busy));

        assert!(slow.await.unwrap().is_ok());
        sup.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_probe_and_terminate_unsupervised_pid() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "exec sleep 30"])
            .spawn()
            .unwrap();
        let pid = child.id();
        assert!(probe_pid(pid));

        // Reap from a blocking thread so the pid disappears once killed.
        let reaper = std::thread::spawn(move || child.wait());
        let forced = terminate_pid(pid, Duration::from_secs(2)).await.unwrap();
        assert!(!forced);
        reaper.join().unwrap().unwrap();
        assert!(!probe_pid(pid));
    }
}
