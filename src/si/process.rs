//! OS process capabilities: liveness checks, signals and spawning.
//!
//! The supervisor and the group monitor only talk to processes through [`ProcessTable`] and
//! [`Spawner`], so their state machines can be exercised without real children.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, getpgid, getpgrp};
use serde::Serialize;

/// How to run one named process. Supplied by the launch configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub executable: PathBuf,
    pub args: Vec<String>,
    /// Applied on top of the inherited environment.
    pub env: BTreeMap<String, String>,
    pub working_directory: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessDescriptor {
    pub name: String,
    pub command: CommandSpec,
    /// Log file receiving stdout and stderr.
    pub output: PathBuf,
    /// Created (recursively) before the process is launched.
    pub dirs: Vec<PathBuf>,
}

pub trait ProcessTable: Send + Sync + fmt::Debug {
    fn is_alive(&self, pid: Pid) -> bool;

    fn signal(&self, pid: Pid, signal: Signal) -> Result<(), Errno>;

    /// Signal every member of process group `pgid`.
    fn signal_group(&self, pgid: Pid, signal: Signal) -> Result<(), Errno>;

    /// Process group of the calling process.
    fn own_process_group(&self) -> Pid;

    fn process_group_of(&self, pid: Pid) -> Result<Pid, Errno>;
}

/// Process group a launched process is placed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessGroup {
    /// Lead a new group whose id is the child's own PID.
    New,
    /// Join an existing group. Only possible within the caller's session.
    Join(Pid),
}

pub trait Spawner: Send + Sync + fmt::Debug {
    /// Start `descriptor` in `group` with stdout and stderr redirected to `output`.
    fn launch(
        &self,
        descriptor: &ProcessDescriptor,
        output: File,
        group: ProcessGroup,
    ) -> io::Result<Pid>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsProcesses;

impl ProcessTable for OsProcesses {
    fn is_alive(&self, pid: Pid) -> bool {
        // Never let a liveness check turn into a group signal.
        if pid.as_raw() <= 0 {
            return false;
        }
        match kill(pid, None) {
            Ok(()) => true,
            // Exists, but belongs to someone else.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn signal(&self, pid: Pid, signal: Signal) -> Result<(), Errno> {
        if pid.as_raw() <= 0 {
            return Err(Errno::ESRCH);
        }
        kill(pid, signal)
    }

    fn signal_group(&self, pgid: Pid, signal: Signal) -> Result<(), Errno> {
        killpg(pgid, signal)
    }

    fn own_process_group(&self) -> Pid {
        getpgrp()
    }

    fn process_group_of(&self, pid: Pid) -> Result<Pid, Errno> {
        if pid.as_raw() <= 0 {
            return Err(Errno::ESRCH);
        }
        getpgid(Some(pid))
    }
}

impl Spawner for OsProcesses {
    fn launch(
        &self,
        descriptor: &ProcessDescriptor,
        output: File,
        group: ProcessGroup,
    ) -> io::Result<Pid> {
        let spec = &descriptor.command;
        let mut cmd = Command::new(&spec.executable);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .current_dir(&spec.working_directory)
            .stdin(Stdio::null())
            .stdout(output.try_clone()?)
            .stderr(output);
        // Out of the caller's job, so a terminal's job control never reaches the service.
        match group {
            ProcessGroup::New => cmd.process_group(0),
            ProcessGroup::Join(pgid) => cmd.process_group(pgid.as_raw()),
        };

        let child = cmd.spawn()?;
        let raw = i32::try_from(child.id())
            .map_err(|_| io::Error::other(format!("pid {} out of range", child.id())))?;
        Ok(Pid::from_raw(raw))
    }
}
