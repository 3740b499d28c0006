//! Service status classification.
//!
//! The four states are checked in priority order; the first rule whose predicate holds wins.
//! Exit codes follow the LSB `status` convention.

use std::collections::BTreeMap;
use std::fmt;

use nix::unistd::Pid;
use serde::Serialize;

use crate::si::error::SupervisorError;
use crate::si::process::ProcessDescriptor;

/// What `status` found for the configured process set at one point in time.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub running: BTreeMap<String, Pid>,
    pub not_running: BTreeMap<String, ProcessDescriptor>,
    /// Every usable PID record, whether or not its process is still alive.
    pub written_pids: BTreeMap<String, Pid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Running,
    Dead,
    NotRunning,
    Error,
}

impl ServiceState {
    fn rule(self) -> &'static Rule {
        // Every state has exactly one rule; Error is listed first.
        RULES
            .iter()
            .find(|rule| rule.state == self)
            .unwrap_or(&RULES[0])
    }

    pub fn exit_code(self) -> u8 {
        self.rule().exit_code
    }

    pub fn message(self) -> &'static str {
        self.rule().message
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServiceState::Running => "running",
            ServiceState::Dead => "dead",
            ServiceState::NotRunning => "not running",
            ServiceState::Error => "error",
        };
        f.write_str(s)
    }
}

pub type Observation = Result<Snapshot, SupervisorError>;

struct Rule {
    state: ServiceState,
    exit_code: u8,
    message: &'static str,
    applies: fn(&Observation) -> bool,
}

fn unreadable(o: &Observation) -> bool {
    o.is_err()
}

// Any record counts, including one for a name that is running fine.
fn missing_after_start(o: &Observation) -> bool {
    matches!(o, Ok(s) if !s.not_running.is_empty() && !s.written_pids.is_empty())
}

fn missing(o: &Observation) -> bool {
    matches!(o, Ok(s) if !s.not_running.is_empty())
}

fn all_running(o: &Observation) -> bool {
    o.is_ok()
}

/// Checked top-down; the first matching rule decides.
static RULES: [Rule; 4] = [
    Rule {
        state: ServiceState::Error,
        exit_code: 4,
        message: "failed to determine service status",
        applies: unreadable,
    },
    Rule {
        state: ServiceState::Dead,
        exit_code: 1,
        message: "processes were started but at least one is no longer running",
        applies: missing_after_start,
    },
    Rule {
        state: ServiceState::NotRunning,
        exit_code: 3,
        message: "service is not running",
        applies: missing,
    },
    Rule {
        state: ServiceState::Running,
        exit_code: 0,
        message: "all processes are running",
        applies: all_running,
    },
];

pub fn classify(observation: &Observation) -> ServiceState {
    RULES
        .iter()
        .find(|rule| (rule.applies)(observation))
        .map(|rule| rule.state)
        .unwrap_or(ServiceState::Error)
}

/// Printable result of a `status` call.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub state: ServiceState,
    pub message: String,
    pub running: BTreeMap<String, i32>,
    pub not_running: Vec<String>,
    pub written_pids: BTreeMap<String, i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusReport {
    pub fn from_observation(observation: &Observation) -> Self {
        let state = classify(observation);
        match observation {
            Ok(s) => Self {
                state,
                message: state.message().to_string(),
                running: raw_pids(&s.running),
                not_running: s.not_running.keys().cloned().collect(),
                written_pids: raw_pids(&s.written_pids),
                error: None,
            },
            Err(e) => Self {
                state,
                message: format!("{}: {e}", state.message()),
                running: BTreeMap::new(),
                not_running: Vec::new(),
                written_pids: BTreeMap::new(),
                error: Some(e.to_string()),
            },
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.state.exit_code()
    }

    pub fn render_text(&self) -> String {
        let mut out = format!("{}: {}", self.state, self.message);
        for (name, pid) in &self.running {
            out.push_str(&format!("\n  {name}: running (pid {pid})"));
        }
        for name in &self.not_running {
            match self.written_pids.get(name) {
                Some(pid) => out.push_str(&format!("\n  {name}: not running (stale pid {pid})")),
                None => out.push_str(&format!("\n  {name}: not running")),
            }
        }
        out
    }
}

fn raw_pids(m: &BTreeMap<String, Pid>) -> BTreeMap<String, i32> {
    m.iter().map(|(k, v)| (k.clone(), v.as_raw())).collect()
}
