//! Error taxonomy shared by the cgroup readers and the supervisor.

use std::fmt;
use std::io;
use std::path::PathBuf;

use nix::errno::Errno;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid config {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum CgroupError {
    #[error("cannot read cgroup file {}: {source}", path.display())]
    CGroupFileUnreadable { path: PathBuf, source: io::Error },
    #[error("no cgroup mount found for subsystem {subsystem:?}")]
    CGroupMountNotFound { subsystem: String },
    #[error("cannot read cpu shares from {}: {source}", path.display())]
    CPUSharesUnreadable { path: PathBuf, source: io::Error },
    #[error("malformed cpu shares in {}: {content:?}", path.display())]
    CPUSharesMalformed { path: PathBuf, content: String },
    #[error("cannot read memory limit from {}: {source}", path.display())]
    MemoryLimitUnreadable { path: PathBuf, source: io::Error },
    #[error("malformed memory limit in {}: {content:?}", path.display())]
    MemoryLimitMalformed { path: PathBuf, content: String },
}

#[derive(Debug, thiserror::Error)]
pub enum PidFileError {
    /// The record exists but does not hold a decimal PID.
    #[error("corrupt pid file {}: {content:?}", path.display())]
    Corrupt { path: PathBuf, content: String },
    #[error("pid file {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}

/// One failure tied to a single named process.
#[derive(Debug, thiserror::Error)]
pub enum ProcessFailure {
    #[error("failed to start {name}: {source}")]
    SpawnFailed { name: String, source: io::Error },
    #[error("started {name} (pid {pid}) but failed to record it: {source}")]
    PersistFailed {
        name: String,
        pid: i32,
        source: PidFileError,
    },
    #[error("failed to signal {name} (pid {pid}): {errno}")]
    SignalDeliveryFailed { name: String, pid: i32, errno: Errno },
    #[error("failed to remove pid file for {name}: {source}")]
    RemoveFailed { name: String, source: PidFileError },
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    ConfigUnavailable(#[from] ConfigError),
    #[error("cannot read pid records: {0}")]
    PidDirUnreadable(#[source] PidFileError),
    #[error("{0}")]
    Batch(Failures),
}

/// Per-name failures collected while the rest of the batch kept going.
#[derive(Debug, Default)]
pub struct Failures(pub Vec<ProcessFailure>);

impl Failures {
    pub fn push(&mut self, failure: ProcessFailure) {
        self.0.push(failure);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_result(self) -> Result<(), SupervisorError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(SupervisorError::Batch(self))
        }
    }
}

impl fmt::Display for Failures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = self.0.len();
        write!(f, "{n} failure{}:", if n == 1 { "" } else { "s" })?;
        for failure in &self.0 {
            write!(f, " [{failure}]")?;
        }
        Ok(())
    }
}
