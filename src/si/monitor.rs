//! Process group death monitor.
//!
//! Runs alongside the primary process and checks it on a fixed period. Once the primary is
//! gone, every process left in its group receives SIGTERM so no sub-process is orphaned when
//! the primary was killed without going through `stop`.

use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, info, warn};

use crate::si::clock::SharedClock;
use crate::si::process::ProcessTable;

pub const DEFAULT_CHECK_PERIOD: Duration = Duration::from_secs(5);

const INIT_PROCESS_GROUP: i32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("refusing to watch process group {pgid}: this process belongs to group {own}")]
    ForeignGroup { pgid: i32, own: i32 },
    #[error("refusing to watch the init process group")]
    InitGroup,
    #[error("check period must be non-zero")]
    ZeroPeriod,
    #[error("failed to signal process group {pgid}: {errno}")]
    SignalFailed { pgid: i32, errno: Errno },
}

/// What happened once the monitored process died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupOutcome {
    Terminated,
    /// Nothing was left in the group to signal.
    AlreadyEmpty,
}

#[derive(Debug)]
pub struct GroupMonitor {
    processes: Arc<dyn ProcessTable>,
    clock: SharedClock,
    service_pid: Pid,
    pgid: Pid,
    period: Duration,
}

impl GroupMonitor {
    /// Checks the preconditions; both group checks are fatal and never retried.
    pub fn new(
        processes: Arc<dyn ProcessTable>,
        clock: SharedClock,
        service_pid: Pid,
        pgid: Pid,
        period: Duration,
    ) -> Result<Self, MonitorError> {
        let own = processes.own_process_group();
        if own != pgid {
            return Err(MonitorError::ForeignGroup {
                pgid: pgid.as_raw(),
                own: own.as_raw(),
            });
        }
        if pgid.as_raw() == INIT_PROCESS_GROUP {
            return Err(MonitorError::InitGroup);
        }
        if period.is_zero() {
            return Err(MonitorError::ZeroPeriod);
        }
        Ok(Self {
            processes,
            clock,
            service_pid,
            pgid,
            period,
        })
    }

    /// Block until the service dies, then SIGTERM its process group.
    pub async fn watch(&self) -> Result<GroupOutcome, MonitorError> {
        info!(
            pid = self.service_pid.as_raw(),
            pgid = self.pgid.as_raw(),
            period_ms = self.period.as_millis() as u64,
            "watching service process"
        );
        let mut ticker = self.clock.ticker(self.period);
        loop {
            ticker.tick().await;
            if self.processes.is_alive(self.service_pid) {
                debug!(pid = self.service_pid.as_raw(), "service alive");
                continue;
            }
            warn!(
                pid = self.service_pid.as_raw(),
                pgid = self.pgid.as_raw(),
                "service process died; terminating process group"
            );
            return match self.processes.signal_group(self.pgid, Signal::SIGTERM) {
                Ok(()) => Ok(GroupOutcome::Terminated),
                Err(Errno::ESRCH) => Ok(GroupOutcome::AlreadyEmpty),
                Err(errno) => Err(MonitorError::SignalFailed {
                    pgid: self.pgid.as_raw(),
                    errno,
                }),
            };
        }
    }
}
