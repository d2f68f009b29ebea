// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Pier Service Contributors

//! Single-instance guard for a data directory.
//!
//! Opening the registry reconciles leftover processes, so two CLI processes
//! on one data directory would fight over the same piers. Every command takes
//! `<data_dir>/pier.lock` first; a lock whose owner is gone is reclaimed.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use pier_core::supervisor::probe_pid;

use crate::error::{CliError, CliResult};

const LOCK_FILE: &str = "pier.lock";

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(data_dir: &Path) -> CliResult<Self> {
        fs::create_dir_all(data_dir).map_err(|source| CliError::Io {
            context: "create data directory",
            source,
        })?;
        let path = data_dir.join(LOCK_FILE);
        let me = std::process::id();

        // Second pass only happens after a stale lock was removed.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", me).map_err(|source| CliError::Io {
                        context: "write instance lock",
                        source,
                    })?;
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    if let Some(pid) = holder {
                        if pid != me && probe_pid(pid) {
                            return Err(CliError::InstanceLocked { pid, path });
                        }
                    }
                    tracing::warn!(path = %path.display(), holder = ?holder, "Reclaiming stale instance lock");
                    let _ = fs::remove_file(&path);
                }
                Err(source) => {
                    return Err(CliError::Io {
                        context: "create instance lock",
                        source,
                    })
                }
            }
        }

        Err(CliError::Io {
            context: "create instance lock",
            source: std::io::Error::new(std::io::ErrorKind::AlreadyExists, "lock keeps reappearing"),
        })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_acquire_and_release() {
        let dir = TempDir::new().unwrap();
        let lock = InstanceLock::acquire(dir.path()).unwrap();
        assert!(dir.path().join(LOCK_FILE).exists());
        drop(lock);
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_live_holder_blocks() {
        let dir = TempDir::new().unwrap();
        // pid 1 always exists.
        fs::write(dir.path().join(LOCK_FILE), "1").unwrap();

        let err = InstanceLock::acquire(dir.path()).unwrap_err();
        assert!(matches!(err, CliError::InstanceLocked { pid: 1, .. }));
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let dir = TempDir::new().unwrap();
        let mut gone = std::process::Command::new("/bin/true").spawn().unwrap();
        let pid = gone.id();
        gone.wait().unwrap();
        fs::write(dir.path().join(LOCK_FILE), pid.to_string()).unwrap();

        let _lock = InstanceLock::acquire(dir.path()).unwrap();
        let owner = fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(owner, std::process::id().to_string());
    }
}
