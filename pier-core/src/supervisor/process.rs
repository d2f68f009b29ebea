// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! One supervised pier process.
//!
//! Each spawned child is owned by a single monitor task. The task is the only
//! place that waits on the child, so "stop requested" and "exited on its own"
//! are decided in one `select!` and can never both be reported.

use std::collections::HashMap;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::SupervisorError;
use crate::state::{ProcessState, ProcessStateMachine};
use crate::types::{PierId, PortPair, ProcessId};

use super::output::OutputBuffer;

/// Everything needed to launch a pier process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub pier_id: PierId,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub directory: PathBuf,
    pub ports: PortPair,
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl ExitInfo {
    pub(crate) fn unknown() -> Self {
        Self {
            code: None,
            signal: None,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "killed by signal {}", sig),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// Why the process exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExitKind {
    /// A stop was requested and the process is gone.
    Requested,
    /// The process exited while booting or running.
    Crashed,
}

/// Delivered exactly once per process on its exit channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitNotification {
    pub pier_id: PierId,
    pub pid: ProcessId,
    pub kind: ExitKind,
    pub info: ExitInfo,
    /// SIGKILL was needed after the graceful timeout.
    pub forced: bool,
    pub uptime: Duration,
}

/// Receiving side of a process's exit channel.
pub type ExitReceiver = oneshot::Receiver<ExitNotification>;

pub(crate) struct StopRequest {
    timeout: Duration,
    reply: oneshot::Sender<ExitNotification>,
}

/// Cheap, cloneable reference to a live process.
///
/// The child itself stays with the monitor task; a handle can only observe
/// it and ask it to stop.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pier_id: PierId,
    pid: ProcessId,
    state: Arc<Mutex<ProcessStateMachine>>,
    stop_tx: mpsc::Sender<StopRequest>,
    exited: watch::Receiver<Option<ExitInfo>>,
    spawned_at: Instant,
}

impl ProcessHandle {
    pub fn pier_id(&self) -> &PierId {
        &self.pier_id
    }

    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.machine().state()
    }

    pub fn uptime(&self) -> Duration {
        self.spawned_at.elapsed()
    }

    fn machine(&self) -> MutexGuard<'_, ProcessStateMachine> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn transition(&self, target: ProcessState) -> Result<(), SupervisorError> {
        self.machine().transition_to(target)?;
        Ok(())
    }

    /// Resolve once the process has exited, with its exit status.
    pub(crate) async fn exited(&self) -> ExitInfo {
        let mut rx = self.exited.clone();
        let info = match rx.wait_for(|v| v.is_some()).await {
            Ok(v) => (*v).unwrap_or_else(ExitInfo::unknown),
            // The monitor is gone without publishing; the child went with it.
            Err(_) => ExitInfo::unknown(),
        };
        info
    }

    /// Ask the monitor to stop the process: SIGTERM, then SIGKILL after
    /// `timeout`. Resolves once the process is gone.
    ///
    /// Returns `NotLive` when the process already exited on its own; its
    /// crash notification was (or is being) delivered instead.
    pub async fn request_stop(&self, timeout: Duration) -> Result<ExitNotification, SupervisorError> {
        let (reply, rx) = oneshot::channel();
        self.stop_tx
            .send(StopRequest { timeout, reply })
            .await
            .map_err(|_| SupervisorError::NotLive)?;
        rx.await.map_err(|_| SupervisorError::NotLive)
    }
}

/// Wire up a freshly spawned child: state machine in `Booting`, output
/// capture running, monitor task owning the child.
pub(crate) fn supervise(
    pier_id: PierId,
    mut child: Child,
    output: Arc<OutputBuffer>,
    live: Arc<DashMap<PierId, ProcessHandle>>,
) -> Result<(ProcessHandle, ExitReceiver), SupervisorError> {
    let raw_pid = child.id().ok_or_else(|| SupervisorError::SpawnFailed {
        program: pier_id.to_string(),
        reason: "process exited before it could be tracked".to_string(),
    })?;
    let pid = ProcessId::new(raw_pid).map_err(|e| SupervisorError::SpawnFailed {
        program: pier_id.to_string(),
        reason: e.to_string(),
    })?;

    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(super::output::capture(
            stdout,
            super::output::OutputStream::Stdout,
            Arc::clone(&output),
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(super::output::capture(
            stderr,
            super::output::OutputStream::Stderr,
            Arc::clone(&output),
        ));
    }

    let mut machine = ProcessStateMachine::new(pier_id.clone());
    machine.transition_to(ProcessState::Booting)?;

    let (stop_tx, stop_rx) = mpsc::channel(4);
    let (exited_tx, exited_rx) = watch::channel(None);
    let (exit_tx, exit_rx) = oneshot::channel();

    let handle = ProcessHandle {
        pier_id: pier_id.clone(),
        pid,
        state: Arc::new(Mutex::new(machine)),
        stop_tx,
        exited: exited_rx,
        spawned_at: Instant::now(),
    };

    live.insert(pier_id, handle.clone());

    tokio::spawn(monitor(
        child,
        handle.clone(),
        stop_rx,
        exited_tx,
        exit_tx,
        live,
    ));

    Ok((handle, exit_rx))
}

async fn monitor(
    mut child: Child,
    handle: ProcessHandle,
    mut stop_rx: mpsc::Receiver<StopRequest>,
    exited_tx: watch::Sender<Option<ExitInfo>>,
    exit_tx: oneshot::Sender<ExitNotification>,
    live: Arc<DashMap<PierId, ProcessHandle>>,
) {
    let pier_id = handle.pier_id.clone();
    let pid = handle.pid;

    let (notification, reply) = tokio::select! {
        status = child.wait() => {
            let info = status.map(ExitInfo::from).unwrap_or_else(|e| {
                tracing::error!(pier_id = %pier_id, pid = %pid, error = %e, "Failed to wait on process");
                ExitInfo::unknown()
            });

            // Nobody asked for this exit, so it is a crash whenever the
            // process was booting or running.
            let kind = {
                let mut machine = handle.machine();
                if machine.state().exit_is_crash() {
                    let _ = machine.transition_to(ProcessState::Crashed);
                    ExitKind::Crashed
                } else {
                    ExitKind::Requested
                }
            };

            if kind == ExitKind::Crashed {
                tracing::warn!(pier_id = %pier_id, pid = %pid, status = %info, "Process exited unexpectedly");
            }

            (notify(&handle, kind, info, false), None)
        }
        Some(request) = stop_rx.recv() => {
            if let Err(e) = handle.transition(ProcessState::Stopping) {
                tracing::debug!(pier_id = %pier_id, error = %e, "Stop requested outside booting/running");
            }

            let (info, forced) = terminate_child(&mut child, pid, request.timeout).await;
            let _ = handle.transition(ProcessState::Stopped);

            tracing::info!(
                pier_id = %pier_id,
                pid = %pid,
                status = %info,
                forced = forced,
                "Process stopped"
            );

            (notify(&handle, ExitKind::Requested, info, forced), Some(request.reply))
        }
    };

    let _ = exited_tx.send(Some(notification.info));
    live.remove_if(&pier_id, |_, h| h.pid == pid);

    if let Some(reply) = reply {
        let _ = reply.send(notification.clone());
    }
    // The receiver may be gone (a failed boot already reported the exit).
    let _ = exit_tx.send(notification);
}

fn notify(handle: &ProcessHandle, kind: ExitKind, info: ExitInfo, forced: bool) -> ExitNotification {
    ExitNotification {
        pier_id: handle.pier_id.clone(),
        pid: handle.pid,
        kind,
        info,
        forced,
        uptime: handle.uptime(),
    }
}

/// SIGTERM, wait up to `timeout`, then SIGKILL. A SIGTERM that cannot be
/// delivered skips the wait.
async fn terminate_child(child: &mut Child, pid: ProcessId, timeout: Duration) -> (ExitInfo, bool) {
    let timeout = match send_signal(pid.value(), Signal::SIGTERM) {
        Ok(()) => timeout,
        Err(e) => {
            tracing::debug!(pid = %pid, error = %e, "SIGTERM failed, killing");
            Duration::ZERO
        }
    };

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => (status.into(), false),
        Ok(Err(e)) => {
            tracing::error!(pid = %pid, error = %e, "Failed to wait on process");
            (ExitInfo::unknown(), false)
        }
        Err(_) => {
            tracing::warn!(pid = %pid, timeout_ms = timeout.as_millis() as u64, "Graceful stop timed out, killing");
            if let Err(e) = child.start_kill() {
                tracing::error!(pid = %pid, error = %e, "SIGKILL failed");
            }
            let info = child
                .wait()
                .await
                .map(ExitInfo::from)
                .unwrap_or_else(|_| ExitInfo::unknown());
            (info, true)
        }
    }
}

/// Signal 0: existence check only.
pub(crate) fn send_signal_probe(pid: u32) -> Result<(), nix::errno::Errno> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => signal::kill(Pid::from_raw(raw), None),
        _ => Err(nix::errno::Errno::ESRCH),
    }
}

pub(crate) fn send_signal(pid: u32, sig: Signal) -> Result<(), SupervisorError> {
    let raw = i32::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .ok_or_else(|| SupervisorError::Signal {
            signal: sig.as_str(),
            pid,
            reason: "pid out of range".to_string(),
        })?;
    signal::kill(Pid::from_raw(raw), sig).map_err(|e| SupervisorError::Signal {
        signal: sig.as_str(),
        pid,
        reason: e.to_string(),
    })
}
