//! Exclusive advisory lock held for the duration of a migration.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use casevault_common::{Error, Result};

/// Guard for `.casevault/lock`. The file is removed on drop.
#[derive(Debug)]
pub struct VaultLock {
    path: PathBuf,
}

impl VaultLock {
    /// Take the lock, replacing it if the recorded owner is gone.
    ///
    /// # Errors
    /// - `Error::Conflict` if a live process holds it
    pub fn acquire(path: &Path) -> Result<Self> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    debug!(path = %path.display(), "Vault lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    match recorded_owner(path) {
                        Some(pid) if process_alive(pid) => {
                            return Err(Error::Conflict(format!(
                                "Vault is in use by process {}",
                                pid
                            )));
                        }
                        _ => {
                            warn!(path = %path.display(), "Replacing stale vault lock");
                            match fs::remove_file(path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::Conflict("Vault lock is contended".to_string()))
    }

    /// Pid of the live process holding the lock at `path`, if any.
    pub fn holder(path: &Path) -> Option<u32> {
        recorded_owner(path).filter(|pid| process_alive(*pid))
    }
}

fn recorded_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
}

impl Drop for VaultLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "Failed to release vault lock: {}", e);
        }
    }
}

#[cfg(target_os = "linux")]
fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

// Without a cheap liveness check, assume the owner is alive.
#[cfg(not(target_os = "linux"))]
fn process_alive(_pid: u32) -> bool {
    true
}
