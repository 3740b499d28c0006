use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use nix::unistd::Pid;
use tracing::{error, info};

use crate::si::clock::RealClock;
use crate::si::config::parse_duration;
use crate::si::logging;
use crate::si::monitor::{GroupMonitor, GroupOutcome};
use crate::si::process::OsProcesses;

#[derive(Debug, Parser)]
#[command(
    name = "group-monitor",
    version,
    about = "SIGTERM a process group once its service process dies"
)]
pub struct Args {
    /// PID of the service process to watch
    #[arg(long = "pid", value_parser = clap::value_parser!(i32).range(1..))]
    pub pid: i32,

    /// Process group to terminate; must be the monitor's own group
    #[arg(long = "pgid", value_parser = clap::value_parser!(i32).range(1..))]
    pub pgid: i32,

    /// Liveness check period, e.g. 5s or 500ms
    #[arg(long = "period", value_parser = parse_duration, default_value = "5s")]
    pub period: Duration,
}

pub fn run() -> ExitCode {
    let args = Args::parse();
    logging::init();
    match watch(&args) {
        Ok(outcome) => {
            info!(pgid = args.pgid, ?outcome, "group monitor finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "group monitor failed");
            eprintln!("group-monitor: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn watch(args: &Args) -> anyhow::Result<GroupOutcome> {
    let monitor = GroupMonitor::new(
        Arc::new(OsProcesses),
        Arc::new(RealClock),
        Pid::from_raw(args.pid),
        Pid::from_raw(args.pgid),
        args.period,
    )?;
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    Ok(rt.block_on(monitor.watch())?)
}
