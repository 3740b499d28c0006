use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::warn;

use crate::si::cgroup::{self, CgroupResolver, MemoryLimitReader, ProcessorCountEstimator};
use crate::si::clock::RealClock;
use crate::si::config::{self, ServiceConfig, load_service_config, parse_duration};
use crate::si::error::SupervisorError;
use crate::si::fsys::OsFs;
use crate::si::output::append_diagnostic;
use crate::si::pidfile::RunLayout;
use crate::si::process::OsProcesses;
use crate::si::status::StatusReport;
use crate::si::supervisor::{StartOutcome, StopOutcome, Supervisor};
use crate::si::{build_info, logging};

#[derive(Debug, Parser)]
#[command(
    name = "svcinit",
    about = "Start, stop and query the processes of a service",
    disable_version_flag = true
)]
pub struct Args {
    /// Launch configuration YAML, relative to --root unless absolute
    #[arg(short = 'c', long = "config", default_value = config::DEFAULT_CONFIG_PATH)]
    pub config: PathBuf,

    /// Service root holding var/run and var/log
    #[arg(long = "root", default_value = ".")]
    pub root: PathBuf,

    /// Print version and build information
    #[arg(short = 'V', long = "version")]
    pub version: bool,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Cmd {
    /// Launch every configured process that is not already running
    Start,
    /// Report whether the service is running (exit 0 running, 1 dead, 3 not running, 4 unknown)
    Status {
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
    /// Terminate every running process, escalating to SIGKILL after the grace period
    Stop {
        /// Overrides supervisor.stop_grace_period, e.g. 30s or 1500ms
        #[arg(long = "grace-period", value_parser = parse_duration)]
        grace_period: Option<Duration>,
        /// Overrides supervisor.stop_poll_interval
        #[arg(long = "poll-interval", value_parser = parse_duration)]
        poll_interval: Option<Duration>,
    },
    /// Show the processor count and memory limit granted by the cgroup
    Resources {
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

pub fn run() -> ExitCode {
    let args = Args::parse();
    logging::init();

    if args.version {
        println!("svcinit {}", build_info::banner());
        return ExitCode::SUCCESS;
    }
    let Some(cmd) = args.cmd.clone() else {
        let _ = Args::command().print_help();
        return ExitCode::from(2);
    };

    let layout = RunLayout::new(&args.root);
    let config_path = layout.resolve(&args.config);
    match cmd {
        Cmd::Start => finish(&layout, "start", run_start(&layout, &config_path)),
        Cmd::Status { format } => run_status(&layout, &config_path, format),
        Cmd::Stop {
            grace_period,
            poll_interval,
        } => finish(
            &layout,
            "stop",
            run_stop(&layout, &config_path, grace_period, poll_interval),
        ),
        Cmd::Resources { format } => finish(&layout, "resources", run_resources(format)),
    }
}

/// Message to stderr and the primary log.
pub fn report_failure(layout: &RunLayout, component: &str, msg: &str) {
    eprintln!("svcinit {component}: {msg}");
    let path = layout.primary_log();
    if let Err(e) = append_diagnostic(&path, component, msg) {
        warn!(path = %path.display(), error = %e, "cannot write to primary log");
    }
}

fn finish(layout: &RunLayout, component: &str, res: anyhow::Result<()>) -> ExitCode {
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report_failure(layout, component, &format!("{e:#}"));
            ExitCode::FAILURE
        }
    }
}

fn os_supervisor(layout: &RunLayout, cfg: &ServiceConfig) -> Supervisor {
    Supervisor::new(
        layout.clone(),
        cfg.descriptors(),
        Arc::new(OsProcesses),
        Arc::new(OsProcesses),
        Arc::new(RealClock),
    )
    .with_stop_settings(cfg.stop)
}

fn run_start(layout: &RunLayout, config_path: &Path) -> anyhow::Result<()> {
    let cfg = load_service_config(config_path, layout)?;
    let outcome = os_supervisor(layout, &cfg).start()?;
    print!("{}", render_start(&outcome));
    Ok(())
}

fn render_start(outcome: &StartOutcome) -> String {
    let mut out = String::new();
    for name in &outcome.already_running {
        out.push_str(&format!("{name}: already running\n"));
    }
    for (name, pid) in &outcome.started {
        out.push_str(&format!("{name}: started (pid {pid})\n"));
    }
    out
}

/// Status never fails as such: every problem maps to a state and its exit code.
pub fn run_status(layout: &RunLayout, config_path: &Path, format: OutputFormat) -> ExitCode {
    let observation = load_service_config(config_path, layout)
        .map_err(SupervisorError::from)
        .and_then(|cfg| os_supervisor(layout, &cfg).snapshot());
    let report = StatusReport::from_observation(&observation);

    match format {
        OutputFormat::Text => println!("{}", report.render_text()),
        OutputFormat::Json => match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{s}"),
            Err(e) => warn!(error = %e, "cannot render status as json"),
        },
    }

    let code = report.exit_code();
    if code != 0 {
        report_failure(layout, "status", &report.message);
    }
    ExitCode::from(code)
}

fn run_stop(
    layout: &RunLayout,
    config_path: &Path,
    grace_period: Option<Duration>,
    poll_interval: Option<Duration>,
) -> anyhow::Result<()> {
    let cfg = load_service_config(config_path, layout)?;
    let mut settings = cfg.stop;
    if let Some(g) = grace_period {
        settings.grace_period = g;
    }
    if let Some(p) = poll_interval {
        anyhow::ensure!(!p.is_zero(), "--poll-interval must be > 0");
        settings.poll_interval = p;
    }
    let supervisor = os_supervisor(layout, &cfg).with_stop_settings(settings);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    let outcome = rt.block_on(supervisor.stop())?;
    print!("{}", render_stop(&outcome));
    Ok(())
}

fn render_stop(outcome: &StopOutcome) -> String {
    let mut out = String::new();
    for name in &outcome.stopped {
        out.push_str(&format!("{name}: stopped\n"));
    }
    for name in &outcome.killed {
        out.push_str(&format!("{name}: killed after grace period\n"));
    }
    for name in &outcome.stale {
        out.push_str(&format!("{name}: removed stale pid file\n"));
    }
    out
}

#[derive(Debug, Serialize)]
struct ResourceReport {
    host_cores: usize,
    processor_count: Option<usize>,
    memory_limit_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<String>,
}

impl ResourceReport {
    fn render_text(&self) -> String {
        let mut out = format!("host cores: {}\n", self.host_cores);
        match self.processor_count {
            Some(n) => out.push_str(&format!("processor count: {n}\n")),
            None => out.push_str("processor count: unknown\n"),
        }
        match self.memory_limit_bytes {
            Some(n) => out.push_str(&format!("memory limit: {n} bytes\n")),
            None => out.push_str("memory limit: unknown\n"),
        }
        out
    }
}

fn run_resources(format: OutputFormat) -> anyhow::Result<()> {
    let resolver = CgroupResolver::new(Arc::new(OsFs));
    let mut errors = Vec::new();
    let processor_count = ProcessorCountEstimator::new(resolver.clone())
        .processor_count()
        .map_err(|e| errors.push(e.to_string()))
        .ok();
    let memory_limit_bytes = MemoryLimitReader::new(resolver)
        .memory_limit_bytes()
        .map_err(|e| errors.push(e.to_string()))
        .ok();
    let report = ResourceReport {
        host_cores: cgroup::host_cores(),
        processor_count,
        memory_limit_bytes,
        errors,
    };

    match format {
        OutputFormat::Text => print!("{}", report.render_text()),
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&report).context("render resources as json")?
        ),
    }
    if !report.errors.is_empty() {
        anyhow::bail!(report.errors.join("; "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;
    use std::fs;

    #[test]
    fn parses_stop_overrides() {
        let args = Args::try_parse_from([
            "svcinit",
            "--root",
            "/srv/app",
            "stop",
            "--grace-period",
            "30s",
            "--poll-interval",
            "250ms",
        ])
        .unwrap();
        assert_eq!(args.root, PathBuf::from("/srv/app"));
        assert_eq!(args.config, PathBuf::from(config::DEFAULT_CONFIG_PATH));
        let Some(Cmd::Stop {
            grace_period,
            poll_interval,
        }) = args.cmd
        else {
            panic!("expected stop");
        };
        assert_eq!(grace_period, Some(Duration::from_secs(30)));
        assert_eq!(poll_interval, Some(Duration::from_millis(250)));
    }

    #[test]
    fn rejects_bad_durations_and_formats() {
        assert!(Args::try_parse_from(["svcinit", "stop", "--grace-period", "soon"]).is_err());
        assert!(
            Args::try_parse_from(["svcinit", "stop", "--poll-interval", "9999999999999h"]).is_err()
        );
        assert!(Args::try_parse_from(["svcinit", "status", "--format", "xml"]).is_err());
        let args = Args::try_parse_from(["svcinit", "-c", "launcher.yml", "status", "--format", "json"])
            .unwrap();
        assert!(matches!(
            args.cmd,
            Some(Cmd::Status {
                format: OutputFormat::Json
            })
        ));
    }

    #[test]
    fn failures_land_in_the_primary_log() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(dir.path());
        report_failure(&layout, "start", "failed to start sidecar");
        let log = fs::read_to_string(layout.primary_log()).unwrap();
        assert!(log.trim_end().ends_with("[start] failed to start sidecar"));
    }

    #[test]
    fn status_without_config_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(dir.path());
        let code = run_status(&layout, &dir.path().join("missing.yml"), OutputFormat::Json);
        assert_eq!(code, ExitCode::from(4));
        let log = fs::read_to_string(layout.primary_log()).unwrap();
        assert!(log.contains("[status] failed to determine service status"));
    }

    #[test]
    fn status_reads_the_configured_records() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RunLayout::new(dir.path());
        let cfg = dir.path().join("launcher.yml");
        fs::write(&cfg, "service:\n  name: app\n  executable: /bin/sleep\n").unwrap();

        assert_eq!(run_status(&layout, &cfg, OutputFormat::Text), ExitCode::from(3));

        crate::si::pidfile::write_pid(
            &layout.pid_file("app"),
            Pid::from_raw(std::process::id() as i32),
        )
        .unwrap();
        assert_eq!(run_status(&layout, &cfg, OutputFormat::Text), ExitCode::SUCCESS);
    }

    #[test]
    fn renders_outcomes() {
        let mut start = StartOutcome::default();
        start.already_running.push("app".to_string());
        start.started.insert("side".to_string(), Pid::from_raw(42));
        assert_eq!(
            render_start(&start),
            "app: already running\nside: started (pid 42)\n"
        );

        let stop = StopOutcome {
            stopped: vec!["app".to_string()],
            killed: vec!["side".to_string()],
            stale: vec![],
        };
        assert_eq!(
            render_stop(&stop),
            "app: stopped\nside: killed after grace period\n"
        );
    }
}
