//! PID-file backed start / status / stop over a flat set of named processes.
//!
//! Every invocation is a separate short-lived process: the PID records under `var/run` are the
//! only state carried between calls, and each record is corroborated with a liveness check
//! before it is trusted.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::si::clock::SharedClock;
use crate::si::config::StopSettings;
use crate::si::error::{Failures, PidFileError, ProcessFailure, SupervisorError};
use crate::si::output::OutputLogs;
use crate::si::pidfile::{RunLayout, read_pid, remove_pid, write_pid};
use crate::si::process::{ProcessDescriptor, ProcessGroup, ProcessTable, Spawner};
use crate::si::status::{Snapshot, StatusReport};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOutcome {
    pub started: BTreeMap<String, Pid>,
    pub already_running: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopOutcome {
    /// Exited on their own after the graceful signal.
    pub stopped: Vec<String>,
    /// Still alive when the grace period ran out and were killed.
    pub killed: Vec<String>,
    /// Records removed for processes that were already gone.
    pub stale: Vec<String>,
}

#[derive(Debug)]
pub struct Supervisor {
    layout: RunLayout,
    descriptors: Vec<ProcessDescriptor>,
    processes: Arc<dyn ProcessTable>,
    spawner: Arc<dyn Spawner>,
    clock: SharedClock,
    stop_settings: StopSettings,
    outputs: OutputLogs,
}

impl Supervisor {
    pub fn new(
        layout: RunLayout,
        descriptors: Vec<ProcessDescriptor>,
        processes: Arc<dyn ProcessTable>,
        spawner: Arc<dyn Spawner>,
        clock: SharedClock,
    ) -> Self {
        Self {
            layout,
            descriptors,
            processes,
            spawner,
            clock,
            stop_settings: StopSettings::default(),
            outputs: OutputLogs::new(),
        }
    }

    pub fn with_stop_settings(mut self, stop_settings: StopSettings) -> Self {
        self.stop_settings = stop_settings;
        self
    }

    /// Corrupt records count as absent; a record that cannot be read at all aborts.
    pub fn snapshot(&self) -> Result<Snapshot, SupervisorError> {
        let mut snapshot = Snapshot::default();
        for d in &self.descriptors {
            let path = self.layout.pid_file(&d.name);
            let pid = match read_pid(&path) {
                Ok(pid) => pid,
                Err(e @ PidFileError::Corrupt { .. }) => {
                    warn!(name = %d.name, error = %e, "ignoring unusable pid record");
                    None
                }
                Err(e) => return Err(SupervisorError::PidDirUnreadable(e)),
            };
            match pid {
                Some(pid) => {
                    snapshot.written_pids.insert(d.name.clone(), pid);
                    if self.processes.is_alive(pid) {
                        snapshot.running.insert(d.name.clone(), pid);
                    } else {
                        debug!(name = %d.name, pid = pid.as_raw(), "recorded process is gone");
                        snapshot.not_running.insert(d.name.clone(), d.clone());
                    }
                }
                None => {
                    snapshot.not_running.insert(d.name.clone(), d.clone());
                }
            }
        }
        Ok(snapshot)
    }

    pub fn status(&self) -> StatusReport {
        StatusReport::from_observation(&self.snapshot())
    }

    /// Launch every configured process that is not already running.
    ///
    /// The primary (first descriptor) leads a new process group and every sub-process joins
    /// it, so the group monitor can take all of them down together. A launch failure does not
    /// stop the remaining launches, and the PIDs of everything that did start are recorded
    /// before the collected failures are returned.
    pub fn start(&self) -> Result<StartOutcome, SupervisorError> {
        let snapshot = self.snapshot()?;
        let mut outcome = StartOutcome::default();
        let mut failures = Failures::default();
        let mut primary_group: Option<Pid> = None;

        for (idx, d) in self.descriptors.iter().enumerate() {
            let is_primary = idx == 0;
            if let Some(pid) = snapshot.running.get(&d.name) {
                info!(name = %d.name, pid = pid.as_raw(), "already running");
                outcome.already_running.push(d.name.clone());
                if is_primary {
                    primary_group = self.processes.process_group_of(*pid).ok();
                }
                continue;
            }
            let group = match primary_group {
                Some(pgid) if !is_primary => ProcessGroup::Join(pgid),
                _ => ProcessGroup::New,
            };
            match self.launch(d, group) {
                Ok(pid) => {
                    info!(name = %d.name, pid = pid.as_raw(), ?group, "started");
                    if is_primary {
                        primary_group = Some(pid);
                    }
                    outcome.started.insert(d.name.clone(), pid);
                }
                Err(source) => {
                    error!(name = %d.name, error = %source, "failed to start");
                    failures.push(ProcessFailure::SpawnFailed {
                        name: d.name.clone(),
                        source,
                    });
                }
            }
        }

        for (name, pid) in &outcome.started {
            if let Err(source) = write_pid(&self.layout.pid_file(name), *pid) {
                error!(name = %name, pid = pid.as_raw(), error = %source, "failed to record pid");
                failures.push(ProcessFailure::PersistFailed {
                    name: name.clone(),
                    pid: pid.as_raw(),
                    source,
                });
            }
        }

        failures.into_result()?;
        Ok(outcome)
    }

    fn launch(&self, d: &ProcessDescriptor, group: ProcessGroup) -> std::io::Result<Pid> {
        match self.spawn(d, group) {
            // A primary started from another session cannot be joined.
            Err(e)
                if matches!(group, ProcessGroup::Join(_))
                    && e.raw_os_error() == Some(Errno::EPERM as i32) =>
            {
                warn!(name = %d.name, error = %e, "cannot join the primary's process group; starting in a group of its own");
                self.spawn(d, ProcessGroup::New)
            }
            res => res,
        }
    }

    fn spawn(&self, d: &ProcessDescriptor, group: ProcessGroup) -> std::io::Result<Pid> {
        for dir in &d.dirs {
            fs::create_dir_all(dir).map_err(|e| {
                std::io::Error::new(e.kind(), format!("create_dir_all {}: {e}", dir.display()))
            })?;
        }
        let output = self.outputs.open(&d.output).map_err(|e| {
            std::io::Error::new(e.kind(), format!("open output {}: {e}", d.output.display()))
        })?;
        self.spawner.launch(d, output, group)
    }

    /// SIGTERM everything running, wait out the grace period, SIGKILL what is left, then drop
    /// the PID records of every process known to be gone.
    pub async fn stop(&self) -> Result<StopOutcome, SupervisorError> {
        let snapshot = self.snapshot()?;
        let mut failures = Failures::default();
        let mut outcome = StopOutcome::default();
        // Names whose process may still be alive; their records stay.
        let mut unresolved: BTreeSet<String> = BTreeSet::new();

        let mut targets: BTreeMap<String, Pid> = BTreeMap::new();
        for (name, pid) in &snapshot.running {
            match self.processes.signal(*pid, Signal::SIGTERM) {
                Ok(()) => {
                    debug!(name = %name, pid = pid.as_raw(), "sent SIGTERM");
                    targets.insert(name.clone(), *pid);
                }
                Err(Errno::ESRCH) => {
                    debug!(name = %name, pid = pid.as_raw(), "exited before SIGTERM");
                    outcome.stopped.push(name.clone());
                }
                Err(errno) => {
                    error!(name = %name, pid = pid.as_raw(), %errno, "cannot deliver SIGTERM");
                    unresolved.insert(name.clone());
                    failures.push(ProcessFailure::SignalDeliveryFailed {
                        name: name.clone(),
                        pid: pid.as_raw(),
                        errno,
                    });
                }
            }
        }

        let leftover = self.await_exit(&targets).await;
        for name in targets.keys() {
            if !leftover.contains_key(name) {
                outcome.stopped.push(name.clone());
            }
        }
        if !leftover.is_empty() {
            warn!(
                grace_period_ms = self.stop_settings.grace_period.as_millis() as u64,
                remaining = leftover.len(),
                "graceful stop timed out; escalating to SIGKILL"
            );
        }
        for (name, pid) in &leftover {
            match self.processes.signal(*pid, Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {
                    info!(name = %name, pid = pid.as_raw(), "killed");
                    outcome.killed.push(name.clone());
                }
                Err(errno) => {
                    error!(name = %name, pid = pid.as_raw(), %errno, "cannot deliver SIGKILL");
                    unresolved.insert(name.clone());
                    failures.push(ProcessFailure::SignalDeliveryFailed {
                        name: name.clone(),
                        pid: pid.as_raw(),
                        errno,
                    });
                }
            }
        }

        for name in snapshot.written_pids.keys() {
            if unresolved.contains(name) {
                continue;
            }
            if !snapshot.running.contains_key(name) {
                outcome.stale.push(name.clone());
            }
            if let Err(source) = remove_pid(&self.layout.pid_file(name)) {
                error!(name = %name, error = %source, "failed to remove pid record");
                failures.push(ProcessFailure::RemoveFailed {
                    name: name.clone(),
                    source,
                });
            }
        }

        failures.into_result()?;
        info!(
            stopped = outcome.stopped.len(),
            killed = outcome.killed.len(),
            stale = outcome.stale.len(),
            "stop complete"
        );
        Ok(outcome)
    }

    /// Poll liveness until every target is gone or the grace period elapses; returns the
    /// targets still alive at the deadline.
    async fn await_exit(&self, targets: &BTreeMap<String, Pid>) -> BTreeMap<String, Pid> {
        let mut remaining = targets.clone();
        if remaining.is_empty() {
            return remaining;
        }
        let mut poll = self.clock.ticker(self.stop_settings.poll_interval);
        let mut deadline = self.clock.sleep(self.stop_settings.grace_period);
        loop {
            tokio::select! {
                _ = poll.tick() => {
                    remaining.retain(|_, pid| self.processes.is_alive(*pid));
                    if remaining.is_empty() {
                        return remaining;
                    }
                }
                _ = &mut deadline => {
                    // Last look: anything that exited right at the deadline is not escalated.
                    remaining.retain(|_, pid| self.processes.is_alive(*pid));
                    return remaining;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::si::clock::{FakeClock, RealClock};
    use crate::si::process::fake::FakeProcesses;
    use crate::si::process::{CommandSpec, OsProcesses};
    use crate::si::status::ServiceState;
    use std::path::PathBuf;
    use std::time::Duration;

    fn desc(layout: &RunLayout, name: &str, primary: bool) -> ProcessDescriptor {
        ProcessDescriptor {
            name: name.to_string(),
            command: CommandSpec {
                executable: PathBuf::from("/bin/sleep"),
                args: vec!["600".to_string()],
                env: BTreeMap::new(),
                working_directory: layout.root().to_path_buf(),
            },
            output: if primary {
                layout.primary_log()
            } else {
                layout.sub_process_log(name)
            },
            dirs: vec![layout.root().join(format!("var/data/{name}"))],
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        layout: RunLayout,
        procs: FakeProcesses,
        clock: FakeClock,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let layout = RunLayout::new(dir.path());
            Self {
                _dir: dir,
                layout,
                procs: FakeProcesses::new(),
                clock: FakeClock::new(),
            }
        }

        fn supervisor(&self, names: &[&str]) -> Supervisor {
            let descriptors = names
                .iter()
                .enumerate()
                .map(|(i, n)| desc(&self.layout, n, i == 0))
                .collect();
            Supervisor::new(
                self.layout.clone(),
                descriptors,
                Arc::new(self.procs.clone()),
                Arc::new(self.procs.clone()),
                Arc::new(self.clock.clone()),
            )
            .with_stop_settings(StopSettings {
                grace_period: Duration::from_secs(10),
                poll_interval: Duration::from_secs(1),
            })
        }

        fn pid_file(&self, name: &str) -> PathBuf {
            self.layout.pid_file(name)
        }

        fn record(&self, name: &str, pid: i32) {
            write_pid(&self.pid_file(name), Pid::from_raw(pid)).unwrap();
        }

        fn recorded(&self, name: &str) -> Option<i32> {
            read_pid(&self.pid_file(name)).unwrap().map(|p| p.as_raw())
        }
    }

    #[test]
    fn start_launches_creates_dirs_and_records_pids() {
        let fx = Fixture::new();
        let sup = fx.supervisor(&["app", "side"]);

        let outcome = sup.start().unwrap();
        assert_eq!(outcome.started.len(), 2);
        assert_eq!(fx.procs.launches(), vec!["app", "side"]);
        assert_eq!(fx.recorded("app"), Some(outcome.started["app"].as_raw()));
        assert_eq!(fx.recorded("side"), Some(outcome.started["side"].as_raw()));
        assert!(fx.layout.root().join("var/data/app").is_dir());
        assert!(fx.layout.primary_log().exists());
        assert!(fx.layout.sub_process_log("side").exists());
        assert_eq!(sup.status().state, ServiceState::Running);
    }

    #[test]
    fn second_start_is_a_no_op() {
        let fx = Fixture::new();
        let sup = fx.supervisor(&["app", "side"]);
        sup.start().unwrap();
        let before = (fx.recorded("app"), fx.recorded("side"));

        let again = fx.supervisor(&["app", "side"]).start().unwrap();
        assert!(again.started.is_empty());
        assert_eq!(again.already_running, vec!["app", "side"]);
        assert_eq!(fx.procs.launches().len(), 2);
        assert_eq!((fx.recorded("app"), fx.recorded("side")), before);
    }

    #[test]
    fn start_only_relaunches_missing_processes() {
        let fx = Fixture::new();
        fx.supervisor(&["app", "side"]).start().unwrap();
        let side_pid = fx.recorded("side").unwrap();
        fx.procs.exit(side_pid);

        let outcome = fx.supervisor(&["app", "side"]).start().unwrap();
        assert_eq!(outcome.already_running, vec!["app"]);
        assert_eq!(outcome.started.keys().collect::<Vec<_>>(), vec!["side"]);
        assert_ne!(fx.recorded("side"), Some(side_pid));
    }

    #[test]
    fn partial_start_failure_still_records_the_successes() {
        let fx = Fixture::new();
        fx.record("other", 77);
        fx.procs.fail_launch("app");

        let err = fx.supervisor(&["app", "side"]).start().unwrap_err();
        let SupervisorError::Batch(failures) = err else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(failures.0.len(), 1);
        assert!(matches!(&failures.0[0], ProcessFailure::SpawnFailed { name, .. } if name == "app"));

        assert_eq!(fx.recorded("app"), None);
        assert!(fx.recorded("side").is_some());
        // Unrelated records are untouched.
        assert_eq!(fx.recorded("other"), Some(77));
    }

    #[test]
    fn unreadable_record_blocks_start() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.pid_file("app")).unwrap();

        let sup = fx.supervisor(&["app"]);
        assert!(matches!(sup.start(), Err(SupervisorError::PidDirUnreadable(_))));
        assert!(fx.procs.launches().is_empty());
    }

    #[test]
    fn persist_failure_is_reported_and_process_keeps_running() {
        let fx = Fixture::new();
        // A non-empty directory squatting on the temp file path makes the write fail for any
        // user, while the record itself is simply absent.
        let blocker = fx
            .layout
            .run_dir()
            .join(format!(".app.pid.tmp.{}", std::process::id()));
        fs::create_dir_all(&blocker).unwrap();
        fs::write(blocker.join("keep"), "x").unwrap();

        let err = fx.supervisor(&["app", "side"]).start().unwrap_err();

        let SupervisorError::Batch(failures) = err else {
            panic!("expected batch failure");
        };
        assert!(matches!(
            &failures.0[..],
            [ProcessFailure::PersistFailed { name, pid: 1000, .. }] if name == "app"
        ));
        assert_eq!(fx.procs.launches(), vec!["app", "side"]);
        assert!(fx.procs.is_alive(Pid::from_raw(1000)));
        assert_eq!(fx.recorded("app"), None);
        // The other record is still written.
        assert_eq!(fx.recorded("side"), Some(1001));
    }

    #[test]
    fn sub_processes_join_the_primary_group() {
        let fx = Fixture::new();
        fx.supervisor(&["app", "side", "tail"]).start().unwrap();
        let app = Pid::from_raw(fx.recorded("app").unwrap());
        assert_eq!(
            fx.procs.launch_groups(),
            vec![
                ("app".to_string(), ProcessGroup::New),
                ("side".to_string(), ProcessGroup::Join(app)),
                ("tail".to_string(), ProcessGroup::Join(app)),
            ]
        );
    }

    #[test]
    fn restarted_sub_process_joins_the_running_primary() {
        let fx = Fixture::new();
        fx.supervisor(&["app", "side"]).start().unwrap();
        let app = Pid::from_raw(fx.recorded("app").unwrap());
        fx.procs.exit(fx.recorded("side").unwrap());

        fx.supervisor(&["app", "side"]).start().unwrap();
        assert_eq!(
            fx.procs.launch_groups().last(),
            Some(&("side".to_string(), ProcessGroup::Join(app)))
        );
    }

    #[test]
    fn unjoinable_primary_group_falls_back_to_a_new_group() {
        let fx = Fixture::new();
        fx.procs.spawn_alive(500);
        fx.record("app", 500);
        fx.procs.foreign_group(500);

        let outcome = fx.supervisor(&["app", "side"]).start().unwrap();
        assert!(outcome.started.contains_key("side"));
        assert_eq!(
            fx.procs.launch_groups(),
            vec![("side".to_string(), ProcessGroup::New)]
        );
    }

    #[test]
    fn without_a_primary_sub_processes_get_their_own_group() {
        let fx = Fixture::new();
        fx.procs.fail_launch("app");
        assert!(fx.supervisor(&["app", "side"]).start().is_err());
        assert_eq!(
            fx.procs.launch_groups(),
            vec![("side".to_string(), ProcessGroup::New)]
        );
    }

    #[test]
    fn real_sub_process_shares_the_primary_process_group() {
        let fx = Fixture::new();
        let sup = Supervisor::new(
            fx.layout.clone(),
            vec![desc(&fx.layout, "app", true), desc(&fx.layout, "side", false)],
            Arc::new(OsProcesses),
            Arc::new(OsProcesses),
            Arc::new(RealClock),
        );
        let outcome = sup.start().unwrap();
        let app = outcome.started["app"];
        let side = outcome.started["side"];

        let app_group = nix::unistd::getpgid(Some(app)).unwrap();
        let side_group = nix::unistd::getpgid(Some(side)).unwrap();
        let own_group = nix::unistd::getpgrp();
        let _ = nix::sys::signal::killpg(app_group, Signal::SIGKILL);

        assert_eq!(app_group, app);
        assert_eq!(side_group, app_group);
        assert_ne!(app_group, own_group);
    }

    #[test]
    fn status_transitions() {
        let fx = Fixture::new();
        let sup = fx.supervisor(&["app", "side"]);
        assert_eq!(sup.status().state, ServiceState::NotRunning);

        fx.procs.spawn_alive(500);
        fx.record("app", 500);
        // "side" has no record, but "app" does.
        assert_eq!(sup.status().state, ServiceState::Dead);

        fx.procs.spawn_alive(501);
        fx.record("side", 501);
        assert_eq!(sup.status().state, ServiceState::Running);

        fx.procs.exit(500);
        let report = sup.status();
        assert_eq!(report.state, ServiceState::Dead);
        assert_eq!(report.exit_code(), 1);
        assert_eq!(report.not_running, vec!["app"]);
    }

    #[test]
    fn corrupt_record_counts_as_absent() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.layout.run_dir()).unwrap();
        fs::write(fx.pid_file("app"), "not-a-pid").unwrap();
        let snapshot = fx.supervisor(&["app"]).snapshot().unwrap();
        assert!(snapshot.written_pids.is_empty());
        assert!(snapshot.not_running.contains_key("app"));
        assert_eq!(fx.supervisor(&["app"]).status().state, ServiceState::NotRunning);
    }

    #[test]
    fn unreadable_record_is_an_error_state() {
        let fx = Fixture::new();
        fs::create_dir_all(fx.pid_file("app")).unwrap();
        let report = fx.supervisor(&["app"]).status();
        assert_eq!(report.state, ServiceState::Error);
        assert_eq!(report.exit_code(), 4);
    }

    #[test]
    fn status_with_real_processes() {
        let fx = Fixture::new();
        let sup = Supervisor::new(
            fx.layout.clone(),
            vec![desc(&fx.layout, "app", true)],
            Arc::new(OsProcesses),
            Arc::new(OsProcesses),
            Arc::new(RealClock),
        );
        assert_eq!(sup.status().exit_code(), 3);

        fx.record("app", std::process::id() as i32);
        assert_eq!(sup.status().exit_code(), 0);

        // Max pid on Linux is at most 2^22; this one cannot exist.
        fx.record("app", 99_999_999);
        assert_eq!(sup.status().exit_code(), 1);
    }

    #[tokio::test]
    async fn stop_graceful_removes_records() {
        let fx = Fixture::new();
        let sup = fx.supervisor(&["app", "side"]);
        sup.start().unwrap();

        let outcome = {
            let stop = sup.stop();
            let drive = async {
                fx.clock.block_until(2).await;
                fx.clock.advance(Duration::from_secs(1));
            };
            let (outcome, ()) = tokio::join!(stop, drive);
            outcome.unwrap()
        };
        assert_eq!(outcome.stopped, vec!["app", "side"]);
        assert!(outcome.killed.is_empty());
        assert_eq!(fx.recorded("app"), None);
        assert_eq!(fx.recorded("side"), None);
        assert!(
            fx.procs
                .signals()
                .iter()
                .all(|(_, sig)| *sig == Signal::SIGTERM)
        );
        assert_eq!(sup.status().state, ServiceState::NotRunning);
    }

    #[tokio::test]
    async fn stop_escalates_only_at_the_deadline() {
        let fx = Fixture::new();
        let sup = fx.supervisor(&["app", "side"]);
        sup.start().unwrap();
        let app = fx.recorded("app").unwrap();
        fx.procs.ignore_term(app);

        let kills = |procs: &FakeProcesses| {
            procs
                .signals()
                .iter()
                .filter(|(_, s)| *s == Signal::SIGKILL)
                .count()
        };

        let stop = sup.stop();
        let drive = async {
            fx.clock.block_until(2).await;
            for _ in 0..9 {
                fx.clock.advance(Duration::from_secs(1));
                for _ in 0..4 {
                    tokio::task::yield_now().await;
                }
                assert_eq!(kills(&fx.procs), 0, "escalated before the deadline");
            }
            fx.clock.advance(Duration::from_secs(1));
        };
        let (outcome, ()) = tokio::join!(stop, drive);
        let outcome = outcome.unwrap();

        assert_eq!(outcome.killed, vec!["app"]);
        assert_eq!(outcome.stopped, vec!["side"]);
        assert_eq!(kills(&fx.procs), 1);
        assert_eq!(fx.clock.elapsed(), Duration::from_secs(10));
        assert_eq!(fx.recorded("app"), None);
        assert_eq!(fx.recorded("side"), None);
    }

    #[tokio::test]
    async fn stop_tolerates_concurrent_exit_and_cleans_stale_records() {
        let fx = Fixture::new();
        let sup = fx.supervisor(&["app", "side"]);
        // Recorded, but dead already.
        fx.record("side", 4321);
        let outcome = sup.stop().await.unwrap();
        assert_eq!(outcome.stale, vec!["side"]);
        assert!(outcome.stopped.is_empty());
        assert_eq!(fx.recorded("side"), None);
        assert_eq!(fx.clock.sleepers(), 0);
    }

    #[tokio::test]
    async fn stop_keeps_records_it_could_not_resolve() {
        let fx = Fixture::new();
        let sup = fx.supervisor(&["app", "side"]);
        sup.start().unwrap();
        let app = fx.recorded("app").unwrap();
        fx.procs.refuse_signals(app);

        let stop = sup.stop();
        let drive = async {
            fx.clock.block_until(2).await;
            fx.clock.advance(Duration::from_secs(1));
        };
        let (res, ()) = tokio::join!(stop, drive);
        let SupervisorError::Batch(failures) = res.unwrap_err() else {
            panic!("expected batch failure");
        };
        assert!(matches!(
            &failures.0[0],
            ProcessFailure::SignalDeliveryFailed { name, errno: Errno::EPERM, .. } if name == "app"
        ));
        assert_eq!(fx.recorded("app"), Some(app));
        assert_eq!(fx.recorded("side"), None);
    }

    #[tokio::test]
    async fn stop_aggregates_removal_failures() {
        let fx = Fixture::new();
        let sup = fx.supervisor(&["app", "side"]);
        sup.start().unwrap();

        let stop = sup.stop();
        let drive = async {
            fx.clock.block_until(2).await;
            // Swap both records for non-empty directories so unlink fails for any user.
            for name in ["app", "side"] {
                let path = fx.pid_file(name);
                fs::remove_file(&path).unwrap();
                fs::create_dir(&path).unwrap();
                fs::write(path.join("keep"), "x").unwrap();
            }
            fx.clock.advance(Duration::from_secs(1));
        };
        let (res, ()) = tokio::join!(stop, drive);

        let SupervisorError::Batch(failures) = res.unwrap_err() else {
            panic!("expected batch failure");
        };
        assert_eq!(failures.0.len(), 2);
        assert!(
            failures
                .0
                .iter()
                .all(|f| matches!(f, ProcessFailure::RemoveFailed { .. }))
        );
        assert!(fx.procs.signals().iter().all(|(_, s)| *s == Signal::SIGTERM));
    }
}
