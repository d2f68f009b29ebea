// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Pier registry: the single owner of pier state.
//!
//! Every command goes through here. The registry validates it against the
//! boot guard, delegates ports to the [`PortAllocator`] and processes to the
//! [`ProcessSupervisor`], persists the outcome and publishes events.
//!
//! Locking:
//! - one async mutex per pier serializes start/stop/clear/delete of that pier;
//! - `registry_lock` serializes create/delete bookkeeping (ids, directories,
//!   ports) and is never held across a spawn or stop.

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinSet;

use crate::boot::{BootStateMachine, PierOperation};
use crate::config::ServiceConfig;
use crate::error::{PierError, PierResult, SupervisorError};
use crate::events::{EventBus, EventStream, PierEventKind};
use crate::ports::PortAllocator;
use crate::store::{PierRecord, PierSnapshot, PierStore};
use crate::supervisor::{self, ExitKind, ExitNotification, ExitReceiver, LaunchSpec, OutputLine, ProcessSupervisor};
use crate::types::{unix_millis, PierId, ProcessId};

/// Input to [`PierRegistry::create`].
#[derive(Debug, Clone)]
pub struct PierSpec {
    /// Becomes the pier id.
    pub name: String,
    /// Data directory; defaults to `<data_dir>/piers/<name>`.
    pub directory: Option<PathBuf>,
}

impl PierSpec {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            directory: None,
        }
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StartOrigin {
    User,
    /// Automatic restart scheduled for the given restart generation.
    Restart(u64),
}

/// Entry in the pier registry.
#[derive(Debug)]
struct PierEntry {
    record: PierRecord,
    boot: BootStateMachine,
    /// Present iff `boot.running()`.
    pid: Option<ProcessId>,
    /// Crashes since the last user start.
    crash_streak: u32,
    /// Bumped by every user command; stale automatic restarts compare
    /// against it and back off.
    restart_gen: u64,
}

impl PierEntry {
    fn new(record: PierRecord) -> Self {
        let boot = BootStateMachine::new(record.id.clone(), record.booted);
        Self {
            record,
            boot,
            pid: None,
            crash_streak: 0,
            restart_gen: 0,
        }
    }

    fn snapshot(&self) -> PierSnapshot {
        PierSnapshot {
            id: self.record.id.clone(),
            directory: self.record.directory.clone(),
            web_port: self.record.web_port,
            loopback_port: self.record.loopback_port,
            booted: self.boot.booted(),
            running: self.boot.running(),
            status: self.boot.status(),
            pid: self.pid.map(|p| p.value()),
            last_error: self.record.last_error.clone(),
            created_at: self.record.created_at,
            last_started_at: self.record.last_started_at,
        }
    }

    fn mark_stopped(&mut self) {
        self.boot.mark_stopped();
        self.pid = None;
        self.record.last_pid = None;
    }
}

/// Thread-safe registry of piers.
#[derive(Debug)]
pub struct PierRegistry {
    config: ServiceConfig,
    piers: DashMap<PierId, PierEntry>,
    locks: DashMap<PierId, Arc<Mutex<()>>>,
    registry_lock: Mutex<()>,
    allocator: PortAllocator,
    supervisor: ProcessSupervisor,
    store: Arc<dyn PierStore>,
    bus: EventBus,
    shutdown: watch::Sender<bool>,
    me: Weak<PierRegistry>,
}

impl PierRegistry {
    /// Load every stored pier and reconcile it with the OS.
    ///
    /// No pier is running after `open`. A record that still names a pid is
    /// left over from an unclean shutdown: if that process is still alive it
    /// is terminated, since it cannot be supervised without its handle, and
    /// either way the pier is demoted to stopped with `last_error` set.
    ///
    /// A record with invalid ports, or whose ports or directory clash with a
    /// pier loaded before it, is skipped with an error log; the others load.
    pub async fn open(config: ServiceConfig, store: Arc<dyn PierStore>) -> PierResult<Arc<Self>> {
        let records = store.load_all()?;
        let (shutdown, _) = watch::channel(false);

        let registry = Arc::new_cyclic(|me| Self {
            allocator: PortAllocator::new(config.ports.clone()),
            supervisor: ProcessSupervisor::new(config.output_buffer_lines),
            config,
            piers: DashMap::new(),
            locks: DashMap::new(),
            registry_lock: Mutex::new(()),
            store,
            bus: EventBus::new(),
            shutdown,
            me: me.clone(),
        });

        let mut skipped = 0usize;
        for mut record in records {
            if let Err(e) = registry.admit(&record) {
                tracing::error!(pier_id = %record.id, error = %e, "Skipping stored pier");
                skipped += 1;
                continue;
            }

            if let Some(pid) = record.last_pid.take() {
                record.last_error = Some(registry.reconcile_orphan(&record.id, pid).await);
                registry.store.save(&record)?;
            }

            registry
                .locks
                .insert(record.id.clone(), Arc::new(Mutex::new(())));
            registry.piers.insert(record.id.clone(), PierEntry::new(record));
        }

        tracing::info!(
            piers = registry.piers.len(),
            skipped = skipped,
            ports_reserved = registry.allocator.in_use(),
            "Pier registry opened"
        );

        Ok(registry)
    }

    /// Check a stored record against the piers already loaded and reserve
    /// its ports.
    fn admit(&self, record: &PierRecord) -> PierResult<()> {
        if self.piers.contains_key(&record.id) {
            return Err(PierError::DuplicateId(record.id.clone()));
        }
        if let Some(owner) = self
            .piers
            .iter()
            .find(|e| e.record.directory == record.directory)
            .map(|e| e.key().clone())
        {
            return Err(PierError::DuplicateDirectory {
                path: record.directory.clone(),
                owner,
            });
        }
        self.allocator.seed(&record.id, record.ports()?)
    }

    async fn reconcile_orphan(&self, id: &PierId, pid: u32) -> String {
        if !supervisor::pid_belongs_to(pid, id) {
            tracing::warn!(pier_id = %id, pid = pid, "Pier process exited while the service was down");
            return format!("process {} exited while the service was down", pid);
        }

        match supervisor::terminate_pid(pid, self.config.timeouts.stop).await {
            Ok(forced) => {
                tracing::warn!(pier_id = %id, pid = pid, forced = forced, "Terminated orphaned pier process");
                format!("orphaned process {} terminated during recovery", pid)
            }
            Err(e) => {
                tracing::error!(pier_id = %id, pid = pid, error = %e, "Failed to terminate orphaned pier process");
                format!("orphaned process {} could not be terminated: {}", pid, e)
            }
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// All piers, ordered by creation time, then id.
    pub fn list(&self) -> Vec<PierSnapshot> {
        let mut piers: Vec<PierSnapshot> = self.piers.iter().map(|e| e.snapshot()).collect();
        piers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        piers
    }

    pub fn get(&self, id: &PierId) -> Option<PierSnapshot> {
        self.piers.get(id).map(|e| e.snapshot())
    }

    pub fn len(&self) -> usize {
        self.piers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.piers.is_empty()
    }

    /// Captured output of the pier's most recent process, optionally only
    /// the last `limit` lines.
    pub fn output(&self, id: &PierId, limit: Option<usize>) -> PierResult<Vec<OutputLine>> {
        if !self.piers.contains_key(id) {
            return Err(PierError::NotFound(id.clone()));
        }
        Ok(self.supervisor.output(id, limit).unwrap_or_default())
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Register a new pier: reserve its ports, provision its directory and
    /// persist it. Any failure leaves no trace.
    pub async fn create(&self, spec: PierSpec) -> PierResult<PierSnapshot> {
        let id = PierId::new(spec.name)?;
        let directory = spec
            .directory
            .unwrap_or_else(|| self.config.default_pier_dir(&id));
        let directory = std::path::absolute(&directory).map_err(|source| PierError::Io {
            context: "resolve pier directory",
            source,
        })?;

        let _registry = self.registry_lock.lock().await;

        if self.piers.contains_key(&id) {
            return Err(PierError::DuplicateId(id));
        }
        if let Some(owner) = self
            .piers
            .iter()
            .find(|e| e.record.directory == directory)
            .map(|e| e.key().clone())
        {
            return Err(PierError::DuplicateDirectory {
                path: directory,
                owner,
            });
        }

        let ports = self.allocator.allocate(&id)?;

        let provisioned = !directory.exists();
        if let Err(source) = std::fs::create_dir_all(&directory) {
            self.allocator.release(&id);
            return Err(PierError::Io {
                context: "create pier directory",
                source,
            });
        }

        let record = PierRecord {
            id: id.clone(),
            directory: directory.clone(),
            web_port: ports.web.value(),
            loopback_port: ports.loopback.value(),
            booted: false,
            last_error: None,
            created_at: unix_millis(),
            last_started_at: None,
            last_pid: None,
        };

        if let Err(e) = self.store.save(&record) {
            self.allocator.release(&id);
            if provisioned {
                let _ = std::fs::remove_dir_all(&directory);
            }
            return Err(e);
        }

        let entry = PierEntry::new(record);
        let snapshot = entry.snapshot();
        self.locks.insert(id.clone(), Arc::new(Mutex::new(())));
        self.piers.insert(id.clone(), entry);

        tracing::info!(pier_id = %id, directory = %directory.display(), ports = %ports, "Pier created");

        self.bus.publish(&id, PierEventKind::Created { directory });
        self.bus.publish(&id, PierEventKind::ports_assigned(ports));

        Ok(snapshot)
    }

    /// Start the pier's process and wait until it is ready. The first start
    /// after creation (or after clearing data) boots the pier.
    pub async fn start(&self, id: &PierId) -> PierResult<PierSnapshot> {
        self.start_inner(id, StartOrigin::User).await?;
        self.get(id).ok_or_else(|| PierError::NotFound(id.clone()))
    }

    /// Stop the pier's process: graceful first, forced after the stop
    /// timeout. Stopping a stopped pier fails with `NotRunning` and changes
    /// nothing.
    pub async fn stop(&self, id: &PierId) -> PierResult<PierSnapshot> {
        self.stop_inner(id, true).await?;
        self.get(id).ok_or_else(|| PierError::NotFound(id.clone()))
    }

    /// Wipe the pier's directory. The pier keeps its ports and boots from
    /// scratch on its next start.
    pub async fn clear_app_data(&self, id: &PierId) -> PierResult<PierSnapshot> {
        let _guard = self.lock_pier(id).await?;

        let directory = {
            let mut entry = self.entry_mut(id)?;
            entry.boot.check(PierOperation::ClearAppData)?;
            entry.restart_gen += 1;
            entry.record.directory.clone()
        };

        match std::fs::remove_dir_all(&directory) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(PierError::Io {
                    context: "clear pier directory",
                    source,
                })
            }
        }
        std::fs::create_dir_all(&directory).map_err(|source| PierError::Io {
            context: "recreate pier directory",
            source,
        })?;

        let ((), record) = self.update(id, |entry| {
            entry.boot.reset_boot();
            entry.record.last_error = None;
        })?;
        self.store.save(&record)?;

        tracing::info!(pier_id = %id, directory = %directory.display(), "Pier data cleared");
        self.bus.publish(id, PierEventKind::DataCleared);

        self.get(id).ok_or_else(|| PierError::NotFound(id.clone()))
    }

    /// Remove the pier: durable record, port reservation and directory.
    pub async fn delete(&self, id: &PierId) -> PierResult<()> {
        let _guard = self.lock_pier(id).await?;

        let (directory, ports) = {
            let entry = self.entry_mut(id)?;
            entry.boot.check(PierOperation::Delete)?;
            (entry.record.directory.clone(), entry.record.ports())
        };

        {
            let _registry = self.registry_lock.lock().await;
            // The record goes first: if the store refuses, nothing changed.
            self.store.remove(id)?;
            self.allocator.release(id);
            self.piers.remove(id);
            self.locks.remove(id);
        }
        self.supervisor.forget(id);

        if let Err(e) = std::fs::remove_dir_all(&directory) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(pier_id = %id, directory = %directory.display(), error = %e, "Failed to remove pier directory");
            }
        }

        match ports {
            Ok(ports) => tracing::info!(pier_id = %id, released = %ports, "Pier deleted"),
            Err(_) => tracing::info!(pier_id = %id, "Pier deleted"),
        }
        self.bus.publish(id, PierEventKind::Deleted);

        Ok(())
    }

    /// Stop every running pier within the shutdown timeout, then kill
    /// whatever is left. In-flight starts and stops are abandoned after the
    /// cancel grace period and fail with `Timeout`.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }

        let running: Vec<PierId> = self
            .piers
            .iter()
            .filter(|e| e.boot.running())
            .map(|e| e.key().clone())
            .collect();

        tracing::info!(running = running.len(), timeout_ms = self.config.timeouts.shutdown.as_millis() as u64, "Shutting down piers");

        if let Some(this) = self.me.upgrade() {
            let mut set = JoinSet::new();
            for id in running {
                let this = Arc::clone(&this);
                set.spawn(async move {
                    let result = this.stop_inner(&id, false).await;
                    (id, result)
                });
            }

            let drained = tokio::time::timeout(self.config.timeouts.shutdown, async {
                while let Some(joined) = set.join_next().await {
                    if let Ok((id, Err(e))) = joined {
                        tracing::warn!(pier_id = %id, error = %e, "Pier did not stop cleanly");
                    }
                }
            })
            .await;

            if drained.is_err() {
                tracing::warn!("Shutdown timeout elapsed, killing remaining piers");
                set.abort_all();
            }
        }

        let killed = self.supervisor.stop_all(Duration::ZERO).await;
        if killed > 0 {
            tracing::warn!(killed = killed, "Force-killed pier processes at shutdown");
        }

        // Anything still flagged running lost its process above.
        let stale: Vec<PierRecord> = self
            .piers
            .iter_mut()
            .filter(|e| e.boot.running())
            .map(|mut e| {
                e.mark_stopped();
                e.record.last_error = Some("killed during shutdown".to_string());
                e.record.clone()
            })
            .collect();

        for record in stale {
            if let Err(e) = self.store.save(&record) {
                tracing::error!(pier_id = %record.id, error = %e, "Failed to persist pier at shutdown");
            }
            self.bus.publish(&record.id, PierEventKind::Stopped { forced: true });
        }

        tracing::info!("Pier shutdown complete");
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn entry_mut(&self, id: &PierId) -> PierResult<dashmap::mapref::one::RefMut<'_, PierId, PierEntry>> {
        self.piers
            .get_mut(id)
            .ok_or_else(|| PierError::NotFound(id.clone()))
    }

    /// Mutate an entry and return the record to persist.
    fn update<R>(&self, id: &PierId, f: impl FnOnce(&mut PierEntry) -> R) -> PierResult<(R, PierRecord)> {
        let mut entry = self.entry_mut(id)?;
        let out = f(&mut entry);
        entry.record.booted = entry.boot.booted();
        Ok((out, entry.record.clone()))
    }

    fn pier_lock(&self, id: &PierId) -> PierResult<Arc<Mutex<()>>> {
        self.locks
            .get(id)
            .map(|l| Arc::clone(l.value()))
            .ok_or_else(|| PierError::NotFound(id.clone()))
    }

    async fn lock_pier(&self, id: &PierId) -> PierResult<OwnedMutexGuard<()>> {
        let lock = self.pier_lock(id)?;
        let guard = Arc::clone(&lock).lock_owned().await;
        // Deleted while we waited, possibly re-created with a fresh mutex.
        let current = self
            .locks
            .get(id)
            .is_some_and(|l| Arc::ptr_eq(l.value(), &lock));
        if !current || !self.piers.contains_key(id) {
            return Err(PierError::NotFound(id.clone()));
        }
        Ok(guard)
    }

    /// Run `fut`, giving up `cancel_grace` after shutdown begins.
    async fn cancellable<F: Future>(&self, fut: F) -> Option<F::Output> {
        let mut shutdown = self.shutdown.subscribe();
        let cancelled = async {
            let closed = shutdown.wait_for(|s| *s).await.is_err();
            if closed {
                std::future::pending::<()>().await;
            }
            tokio::time::sleep(self.config.timeouts.cancel_grace).await;
        };

        tokio::select! {
            out = fut => Some(out),
            _ = cancelled => None,
        }
    }

    /// Persist a failed command's error on the pier. The command still fails
    /// with `error`; a store failure here is only logged.
    fn record_failure(&self, id: &PierId, error: &PierError) {
        let Ok(((), record)) = self.update(id, |entry| {
            entry.record.last_error = Some(error.to_string());
        }) else {
            return;
        };
        if let Err(e) = self.store.save(&record) {
            tracing::error!(pier_id = %id, error = %e, "Failed to persist pier error");
        }
    }

    /// Returns false when an automatic restart was superseded.
    async fn start_inner(&self, id: &PierId, origin: StartOrigin) -> PierResult<bool> {
        if self.is_shutting_down() {
            return Err(PierError::Timeout {
                pier_id: id.clone(),
                operation: "start",
            });
        }

        let _guard = self.lock_pier(id).await?;

        let (directory, first_boot) = {
            let mut entry = self.entry_mut(id)?;
            match origin {
                StartOrigin::Restart(generation) => {
                    if entry.restart_gen != generation || entry.boot.running() {
                        return Ok(false);
                    }
                }
                StartOrigin::User => {
                    entry.boot.check(PierOperation::Start)?;
                    entry.restart_gen += 1;
                    entry.crash_streak = 0;
                }
            }
            (entry.record.directory.clone(), !entry.boot.booted())
        };

        let ports = self.allocator.allocate(id)?;
        let launcher = &self.config.launcher;
        let spec = LaunchSpec {
            pier_id: id.clone(),
            program: launcher.program.clone(),
            args: launcher.render_args(first_boot, id, &directory, ports),
            env: launcher.env.clone(),
            directory,
            ports,
        };

        tracing::info!(pier_id = %id, first_boot = first_boot, ports = %ports, restart = matches!(origin, StartOrigin::Restart(_)), "Starting pier");

        let spawned = self
            .cancellable(self.supervisor.spawn(
                spec,
                self.config.readiness,
                self.config.timeouts.startup,
                self.config.timeouts.stop,
            ))
            .await;

        let (handle, exit_rx) = match spawned {
            Some(Ok(spawned)) => spawned,
            Some(Err(e)) => {
                let err = e.into_pier_error(id);
                tracing::warn!(pier_id = %id, error = %err, "Pier failed to start");
                self.record_failure(id, &err);
                return Err(err);
            }
            None => {
                let err = PierError::Timeout {
                    pier_id: id.clone(),
                    operation: "start",
                };
                self.record_failure(id, &err);
                return Err(err);
            }
        };

        let pid = handle.pid();
        let (booted_now, record) = self.update(id, |entry| {
            let first = entry.boot.mark_running();
            entry.pid = Some(pid);
            entry.record.last_pid = Some(pid.value());
            entry.record.last_started_at = Some(unix_millis());
            entry.record.last_error = None;
            first
        })?;

        if let Err(e) = self.store.save(&record) {
            // Unrecorded processes would become orphans on the next open.
            tracing::error!(pier_id = %id, pid = %pid, error = %e, "Failed to persist started pier, stopping it");
            let _ = self.supervisor.stop(id, self.config.timeouts.stop).await;
            let _ = self.update(id, PierEntry::mark_stopped);
            return Err(e);
        }

        self.bus.publish(id, PierEventKind::ports_assigned(ports));
        if booted_now {
            self.bus.publish(id, PierEventKind::Booted);
        }
        self.bus.publish(id, PierEventKind::Started { pid: pid.value() });

        tracing::info!(pier_id = %id, pid = %pid, booted = booted_now, "Pier running");

        self.watch_exit(exit_rx);
        Ok(true)
    }

    async fn stop_inner(&self, id: &PierId, cancellable: bool) -> PierResult<()> {
        let _guard = self.lock_pier(id).await?;

        let pid = {
            let mut entry = self.entry_mut(id)?;
            // A stop also cancels any pending automatic restart.
            entry.restart_gen += 1;
            entry.boot.check(PierOperation::Stop)?;
            entry.pid
        };

        let stopping = self.supervisor.stop(id, self.config.timeouts.stop);
        let result = if cancellable {
            self.cancellable(stopping).await
        } else {
            Some(stopping.await)
        };

        match result {
            Some(Ok(note)) => {
                let ((), record) = self.update(id, PierEntry::mark_stopped)?;
                tracing::info!(pier_id = %id, pid = %note.pid, forced = note.forced, "Pier stopped");
                self.bus.publish(id, PierEventKind::Stopped { forced: note.forced });
                self.store.save(&record)
            }
            Some(Err(SupervisorError::NotLive)) => {
                // Exited on its own before the stop landed; the exit watcher
                // will find the pid cleared and stay quiet.
                let reason = "process exited before stop".to_string();
                self.record_crash(id, pid, None, None, reason)?;
                Ok(())
            }
            Some(Err(e)) => Err(e.into_pier_error(id)),
            None => Err(PierError::Timeout {
                pier_id: id.clone(),
                operation: "stop",
            }),
        }
    }

    fn watch_exit(&self, exit_rx: ExitReceiver) {
        let Some(this) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let Ok(note) = exit_rx.await else {
                return;
            };
            if note.kind == ExitKind::Crashed {
                this.handle_crash(note).await;
            }
        });
    }

    async fn handle_crash(&self, note: ExitNotification) {
        let id = note.pier_id.clone();
        let Ok(_guard) = self.lock_pier(&id).await else {
            return;
        };

        // A process that outlived the longest backoff starts a fresh streak.
        if note.uptime > self.config.restart.backoff.max {
            if let Some(mut entry) = self.piers.get_mut(&id) {
                if entry.pid == Some(note.pid) {
                    entry.crash_streak = 0;
                }
            }
        }

        let recorded = self.record_crash(
            &id,
            Some(note.pid),
            note.info.code,
            note.info.signal,
            format!("process crashed ({})", note.info),
        );

        let (streak, generation) = match recorded {
            Ok(Some(state)) => state,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(pier_id = %id, error = %e, "Failed to persist pier crash");
                return;
            }
        };

        let restart = self.config.restart;
        if !restart.enabled || self.is_shutting_down() {
            return;
        }
        if streak > restart.max_attempts {
            tracing::warn!(pier_id = %id, attempts = restart.max_attempts, "Restart attempts exhausted, leaving pier stopped");
            return;
        }
        self.schedule_restart(id, generation);
    }

    /// Flip a pier to stopped after an unrequested exit and publish exactly
    /// one `Crashed`. Returns the crash streak and restart generation, or
    /// `None` when `pid` no longer belongs to the pier.
    fn record_crash(
        &self,
        id: &PierId,
        pid: Option<ProcessId>,
        exit_code: Option<i32>,
        signal: Option<i32>,
        reason: String,
    ) -> PierResult<Option<(u32, u64)>> {
        let (state, record) = {
            let mut entry = self.entry_mut(id)?;
            if entry.pid.is_none() || entry.pid != pid {
                return Ok(None);
            }
            entry.mark_stopped();
            entry.record.last_error = Some(reason.clone());
            entry.crash_streak += 1;
            ((entry.crash_streak, entry.restart_gen), entry.record.clone())
        };

        tracing::warn!(pier_id = %id, reason = %reason, streak = state.0, "Pier crashed");
        self.bus.publish(
            id,
            PierEventKind::Crashed {
                exit_code,
                signal,
                reason,
            },
        );

        self.store.save(&record)?;
        Ok(Some(state))
    }

    /// Report an automatic restart that never came up. Nobody awaits the
    /// restart, so the failure goes out as a `Crashed` event. Returns whether
    /// another attempt is allowed.
    fn restart_failed(&self, id: &PierId, streak: u32, error: PierError) -> bool {
        let max_attempts = self.config.restart.max_attempts;
        let exhausted = streak > max_attempts;
        let reason = if exhausted {
            format!("restart failed, giving up after {} attempts: {}", max_attempts, error)
        } else {
            format!("restart failed: {}", error)
        };

        if exhausted {
            tracing::warn!(pier_id = %id, error = %error, "Restart attempts exhausted, leaving pier stopped");
            let recorded = self.update(id, |entry| {
                entry.record.last_error = Some(reason.clone());
            });
            if let Ok(((), record)) = recorded {
                if let Err(e) = self.store.save(&record) {
                    tracing::error!(pier_id = %id, error = %e, "Failed to persist pier error");
                }
            }
        } else {
            tracing::warn!(pier_id = %id, attempt = streak, error = %error, "Pier restart failed");
        }

        self.bus.publish(
            id,
            PierEventKind::Crashed {
                exit_code: None,
                signal: None,
                reason,
            },
        );
        !exhausted
    }

    fn schedule_restart(&self, id: PierId, generation: u64) {
        let Some(this) = self.me.upgrade() else {
            return;
        };

        tokio::spawn(async move {
            let mut shutdown = this.shutdown.subscribe();
            loop {
                let attempt = this
                    .piers
                    .get(&id)
                    .map(|e| e.crash_streak)
                    .unwrap_or(0);
                if attempt == 0 {
                    return;
                }
                let delay = this.config.restart.backoff.next(attempt - 1);
                tracing::info!(pier_id = %id, attempt = attempt, delay_ms = delay.as_millis() as u64, "Scheduling pier restart");

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.wait_for(|s| *s) => return,
                }

                match this.start_inner(&id, StartOrigin::Restart(generation)).await {
                    Ok(_) => return,
                    Err(PierError::NotFound(_)) => return,
                    Err(_) if this.is_shutting_down() => return,
                    Err(e) => {
                        let streak = match this.piers.get_mut(&id) {
                            Some(mut entry) if entry.restart_gen == generation => {
                                entry.crash_streak += 1;
                                entry.crash_streak
                            }
                            _ => return,
                        };
                        if !this.restart_failed(&id, streak, e) {
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;
    use crate::store::MemoryStore;
    use tempfile::TempDir;

    async fn registry(dir: &TempDir) -> (Arc<PierRegistry>, Arc<MemoryStore>) {
        let yaml = format!(
            "service:\n  data_dir: {}\nports:\n  verify_bind: false\n",
            dir.path().display()
        );
        let config = ConfigLoader::load_string(&yaml).unwrap();
        let store = Arc::new(MemoryStore::new());
        let registry = PierRegistry::open(config, store.clone()).await.unwrap();
        (registry, store)
    }

    #[tokio::test]
    async fn test_create_assigns_first_ports() {
        let dir = TempDir::new().unwrap();
        let (reg, store) = registry(&dir).await;

        let zod = reg.create(PierSpec::named("zod")).await.unwrap();
        assert_eq!((zod.web_port, zod.loopback_port), (8080, 12321));
        assert!(!zod.booted);
        assert!(!zod.running);
        assert!(zod.directory.is_dir());
        assert!(store.get(&zod.id).is_some());

        let bus = reg.create(PierSpec::named("bus")).await.unwrap();
        assert_eq!((bus.web_port, bus.loopback_port), (8081, 12322));
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates() {
        let dir = TempDir::new().unwrap();
        let (reg, _) = registry(&dir).await;

        reg.create(PierSpec::named("zod")).await.unwrap();
        assert!(matches!(
            reg.create(PierSpec::named("zod")).await,
            Err(PierError::DuplicateId(_))
        ));

        let shared = dir.path().join("shared");
        reg.create(PierSpec::named("bus").with_directory(&shared))
            .await
            .unwrap();
        assert!(matches!(
            reg.create(PierSpec::named("nec").with_directory(&shared)).await,
            Err(PierError::DuplicateDirectory { .. })
        ));
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test]
    async fn test_create_rolls_back_on_store_failure() {
        let dir = TempDir::new().unwrap();
        let (reg, store) = registry(&dir).await;

        store.set_read_only(true);
        let err = reg.create(PierSpec::named("zod")).await.unwrap_err();
        assert!(matches!(err, PierError::StoreUnavailable { .. }));
        assert!(reg.is_empty());
        assert!(!dir.path().join("piers").join("zod").exists());

        // The ports were returned to the pool.
        store.set_read_only(false);
        let zod = reg.create(PierSpec::named("zod")).await.unwrap();
        assert_eq!(zod.web_port, 8080);
    }

    #[tokio::test]
    async fn test_invalid_name_rejected() {
        let dir = TempDir::new().unwrap();
        let (reg, _) = registry(&dir).await;
        assert!(matches!(
            reg.create(PierSpec::named("../etc")).await,
            Err(PierError::HardValidation(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_stopped_pier_is_not_running() {
        let dir = TempDir::new().unwrap();
        let (reg, _) = registry(&dir).await;
        let zod = reg.create(PierSpec::named("zod")).await.unwrap();

        let mut events = reg.subscribe();
        assert!(matches!(reg.stop(&zod.id).await, Err(PierError::NotRunning(_))));
        assert!(events.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_unknown_pier() {
        let dir = TempDir::new().unwrap();
        let (reg, _) = registry(&dir).await;
        let ghost = PierId::new("ghost").unwrap();

        assert!(matches!(reg.start(&ghost).await, Err(PierError::NotFound(_))));
        assert!(matches!(reg.delete(&ghost).await, Err(PierError::NotFound(_))));
        assert!(matches!(reg.output(&ghost, None), Err(PierError::NotFound(_))));
        assert!(reg.get(&ghost).is_none());
    }

    #[tokio::test]
    async fn test_delete_frees_ports_and_record() {
        let dir = TempDir::new().unwrap();
        let (reg, store) = registry(&dir).await;
        let zod = reg.create(PierSpec::named("zod")).await.unwrap();

        reg.delete(&zod.id).await.unwrap();
        assert!(store.get(&zod.id).is_none());
        assert!(!zod.directory.exists());

        let bus = reg.create(PierSpec::named("bus")).await.unwrap();
        assert_eq!((bus.web_port, bus.loopback_port), (8080, 12321));
    }

    #[tokio::test]
    async fn test_clear_data_keeps_ports() {
        let dir = TempDir::new().unwrap();
        let (reg, _) = registry(&dir).await;
        let zod = reg.create(PierSpec::named("zod")).await.unwrap();
        std::fs::write(zod.directory.join("state.db"), b"data").unwrap();

        let cleared = reg.clear_app_data(&zod.id).await.unwrap();
        assert!(!cleared.booted);
        assert_eq!(cleared.web_port, zod.web_port);
        assert!(zod.directory.is_dir());
        assert!(!zod.directory.join("state.db").exists());
    }

    #[tokio::test]
    async fn test_open_skips_clashing_records() {
        let dir = TempDir::new().unwrap();
        let record = |name: &str, created_at: u64, web: u16, loopback: u16, subdir: &str| PierRecord {
            id: PierId::new(name).unwrap(),
            directory: dir.path().join(subdir),
            web_port: web,
            loopback_port: loopback,
            booted: true,
            last_error: None,
            created_at,
            last_started_at: None,
            last_pid: None,
        };
        let store = Arc::new(MemoryStore::with_records([
            record("zod", 1, 8080, 12321, "zod"),
            // Same web port as zod.
            record("bus", 2, 8080, 12322, "bus"),
            // Same directory as zod.
            record("nec", 3, 8082, 12323, "zod"),
            // Web and loopback collide.
            record("lur", 4, 8090, 8090, "lur"),
            record("pel", 5, 8083, 12324, "pel"),
        ]));
        let yaml = format!(
            "service:\n  data_dir: {}\nports:\n  verify_bind: false\n",
            dir.path().display()
        );
        let config = ConfigLoader::load_string(&yaml).unwrap();

        let reg = PierRegistry::open(config, store).await.unwrap();

        let names: Vec<String> = reg.list().into_iter().map(|p| p.id.to_string()).collect();
        assert_eq!(names, vec!["zod", "pel"]);
        assert_eq!(reg.allocator.in_use(), 2);

        // A skipped pier's ports were never reserved.
        let bus = reg.create(PierSpec::named("bus")).await.unwrap();
        assert_eq!((bus.web_port, bus.loopback_port), (8081, 12322));
    }

    #[tokio::test]
    async fn test_waiter_on_replaced_lock_is_turned_away() {
        let dir = TempDir::new().unwrap();
        let (reg, _) = registry(&dir).await;
        let zod = reg.create(PierSpec::named("zod")).await.unwrap().id;

        let held = reg.pier_lock(&zod).unwrap().lock_owned().await;
        let waiter = {
            let reg = Arc::clone(&reg);
            let zod = zod.clone();
            tokio::spawn(async move { reg.lock_pier(&zod).await.map(drop) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Deleted and re-created under the same id while the waiter queued.
        reg.locks.insert(zod.clone(), Arc::new(Mutex::new(())));
        drop(held);

        assert!(matches!(waiter.await.unwrap(), Err(PierError::NotFound(_))));
        // The fresh lock is free and usable.
        assert!(reg.lock_pier(&zod).await.is_ok());
    }

    #[tokio::test]
    async fn test_list_ordered_by_creation() {
        let dir = TempDir::new().unwrap();
        let (reg, _) = registry(&dir).await;
        for name in ["zod", "bus", "nec"] {
            reg.create(PierSpec::named(name)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        let names: Vec<String> = reg.list().into_iter().map(|p| p.id.to_string()).collect();
        assert_eq!(names, vec!["zod", "bus", "nec"]);
    }
}
