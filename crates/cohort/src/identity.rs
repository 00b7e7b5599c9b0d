//! Identity assignment
//!
//! Members obtain their `ProcessId` once, at startup, from a counter that every
//! member of the group can see. The counter must only be touched under an
//! exclusive-access mechanism so two independent processes can never read the
//! same value.
//!
//! Two registries are provided:
//! - [`FileIdentityRegistry`]: a counter file next to an exclusively created
//!   lock file, shared by processes on one host (or one shared filesystem).
//! - [`MemoryIdentityRegistry`]: an explicitly shared counter for groups whose
//!   members all live in one OS process (tests, simulations).

use async_trait::async_trait;
use cohort_types::{CohortError, GroupConfig, ProcessId, Result};
use parking_lot::Mutex;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the shared counter file inside the registry directory
pub const COUNTER_FILE: &str = "cohort_process_counter.txt";

/// Source of group-unique process ids and of the group size
#[async_trait]
pub trait IdentityRegistry: Send + Sync {
    /// Hand out an id never returned before, in `[0, group_size)`
    async fn assign(&self) -> Result<ProcessId>;

    /// Number of members in the group
    fn group_size(&self) -> usize;
}

/// File-backed counter guarded by a lock file
#[derive(Debug, Clone)]
pub struct FileIdentityRegistry {
    dir: PathBuf,
    counter_path: PathBuf,
    lock_path: PathBuf,
    group_size: usize,
    lock_attempts: u32,
    lock_retry_delay: Duration,
}

impl FileIdentityRegistry {
    /// Create a registry rooted at `config.registry_dir`
    pub fn new(config: &GroupConfig) -> Result<Self> {
        config.validate()?;
        let dir = config.registry_dir.clone();
        let counter_path = dir.join(COUNTER_FILE);
        let lock_path = dir.join(format!("{COUNTER_FILE}.lock"));
        Ok(Self {
            dir,
            counter_path,
            lock_path,
            group_size: config.group_size,
            lock_attempts: config.lock_attempts,
            lock_retry_delay: config.lock_retry_delay,
        })
    }

    /// Path of the counter file
    pub fn counter_path(&self) -> &Path {
        &self.counter_path
    }

    /// Path of the lock file
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Remove the counter and lock files so the next group starts at id 0
    pub async fn reset(&self) -> Result<()> {
        for path in [&self.counter_path, &self.lock_path] {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "removed registry file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn acquire_lock(&self) -> Result<LockGuard> {
        for attempt in 1..=self.lock_attempts {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.lock_path)
                .await
            {
                Ok(_) => {
                    return Ok(LockGuard {
                        path: self.lock_path.clone(),
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    debug!(attempt, "identity lock busy");
                    tokio::time::sleep(self.lock_retry_delay).await;
                }
                Err(e) => {
                    return Err(CohortError::identity_assignment(format!(
                        "cannot create {}: {e}",
                        self.lock_path.display()
                    )))
                }
            }
        }
        Err(CohortError::identity_assignment(format!(
            "{} still held after {} attempts",
            self.lock_path.display(),
            self.lock_attempts
        )))
    }

    async fn read_counter(&self) -> Result<u32> {
        match tokio::fs::read_to_string(&self.counter_path).await {
            Ok(content) => content.trim().parse().map_err(|_| {
                CohortError::identity_assignment(format!(
                    "{} is corrupt: {:?}",
                    self.counter_path.display(),
                    content.trim()
                ))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
            Err(e) => Err(CohortError::identity_assignment(format!(
                "cannot read {}: {e}",
                self.counter_path.display()
            ))),
        }
    }

    async fn write_counter(&self, value: u32) -> Result<()> {
        let tmp = self.counter_path.with_extension("txt.tmp");
        tokio::fs::write(&tmp, value.to_string())
            .await
            .map_err(|e| {
                CohortError::identity_assignment(format!("cannot write {}: {e}", tmp.display()))
            })?;
        tokio::fs::rename(&tmp, &self.counter_path)
            .await
            .map_err(|e| {
                CohortError::identity_assignment(format!(
                    "cannot replace {}: {e}",
                    self.counter_path.display()
                ))
            })
    }
}

#[async_trait]
impl IdentityRegistry for FileIdentityRegistry {
    async fn assign(&self) -> Result<ProcessId> {
        tokio::fs::create_dir_all(&self.dir).await.map_err(|e| {
            CohortError::identity_assignment(format!(
                "cannot create registry directory {}: {e}",
                self.dir.display()
            ))
        })?;
        let _guard = self.acquire_lock().await?;

        let next = self.read_counter().await?;
        if next as usize >= self.group_size {
            return Err(CohortError::identity_assignment(format!(
                "group of {} is full",
                self.group_size
            )));
        }
        self.write_counter(next + 1).await?;

        let id = ProcessId(next);
        info!(process = %id, group_size = self.group_size, "assigned process id");
        Ok(id)
    }

    fn group_size(&self) -> usize {
        self.group_size
    }
}

/// Removes the lock file when dropped
#[derive(Debug)]
struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release identity lock");
        }
    }
}

/// Counter shared by cloning, for groups living in one OS process
#[derive(Debug, Clone)]
pub struct MemoryIdentityRegistry {
    next: Arc<Mutex<u32>>,
    group_size: usize,
}

impl MemoryIdentityRegistry {
    /// Create a registry for a group of `group_size`
    pub fn new(group_size: usize) -> Result<Self> {
        GroupConfig::with_group_size(group_size).validate()?;
        Ok(Self {
            next: Arc::new(Mutex::new(0)),
            group_size,
        })
    }
}

#[async_trait]
impl IdentityRegistry for MemoryIdentityRegistry {
    async fn assign(&self) -> Result<ProcessId> {
        let mut next = self.next.lock();
        if *next as usize >= self.group_size {
            return Err(CohortError::identity_assignment(format!(
                "group of {} is full",
                self.group_size
            )));
        }
        let id = ProcessId(*next);
        *next += 1;
        Ok(id)
    }

    fn group_size(&self) -> usize {
        self.group_size
    }
}
