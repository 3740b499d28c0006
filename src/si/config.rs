use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::si::error::ConfigError;
use crate::si::pidfile::RunLayout;
use crate::si::process::{CommandSpec, ProcessDescriptor};

pub const DEFAULT_CONFIG_PATH: &str = "service/bin/launcher.yml";
pub const DEFAULT_PRIMARY_NAME: &str = "service";

const DEFAULT_STOP_GRACE_PERIOD: Duration = Duration::from_secs(240);
const DEFAULT_STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const MAX_DURATION: Duration = Duration::from_secs(365 * 86400);

/// How long `stop` waits for a graceful exit and how often it checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSettings {
    pub grace_period: Duration,
    pub poll_interval: Duration,
}

impl Default for StopSettings {
    fn default() -> Self {
        Self {
            grace_period: DEFAULT_STOP_GRACE_PERIOD,
            poll_interval: DEFAULT_STOP_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub primary: ProcessDescriptor,
    /// Sorted by name.
    pub sub_processes: Vec<ProcessDescriptor>,
    pub stop: StopSettings,
}

impl ServiceConfig {
    /// Primary first, then sub-processes by name.
    pub fn descriptors(&self) -> Vec<ProcessDescriptor> {
        let mut out = Vec::with_capacity(1 + self.sub_processes.len());
        out.push(self.primary.clone());
        out.extend(self.sub_processes.iter().cloned());
        out
    }
}

// -------- YAML file schema (strict) --------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LauncherConfigFile {
    service: ServiceSection,
    #[serde(default)]
    sub_processes: BTreeMap<String, ProcessSection>,
    #[serde(default)]
    supervisor: Option<SupervisorSection>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceSection {
    #[serde(default = "default_primary_name")]
    name: String,
    executable: PathBuf,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    dirs: Vec<PathBuf>,
    #[serde(default)]
    working_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ProcessSection {
    executable: PathBuf,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    dirs: Vec<PathBuf>,
    #[serde(default)]
    working_directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct SupervisorSection {
    #[serde(default, deserialize_with = "deserialize_duration_opt")]
    stop_grace_period: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_duration_opt")]
    stop_poll_interval: Option<Duration>,
}

fn default_primary_name() -> String {
    DEFAULT_PRIMARY_NAME.to_string()
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error as _;
    let v = serde_yaml::Value::deserialize(deserializer)?;
    match v {
        serde_yaml::Value::Null => Ok(None),
        serde_yaml::Value::Number(n) => n
            .as_u64()
            .map(Duration::from_millis)
            .filter(|d| *d <= MAX_DURATION)
            .map(Some)
            .ok_or_else(|| D::Error::custom("duration must be an integer of ms up to 365 days")),
        serde_yaml::Value::String(s) => parse_duration(&s).map(Some).map_err(D::Error::custom),
        _ => Err(D::Error::custom(
            "duration must be an integer milliseconds or string like \"30s\"",
        )),
    }
}

/// Parse `1500ms`, `30s`, `4m`, `1h` or fractional forms like `1.5s`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let t = s.trim();
    if t.is_empty() {
        return Err("empty duration".to_string());
    }
    let idx = t
        .char_indices()
        .find(|(_, ch)| !(ch.is_ascii_digit() || *ch == '.'))
        .map(|(i, _)| i)
        .unwrap_or(t.len());
    if idx == 0 {
        return Err(format!("invalid duration: {s}"));
    }
    let (num_s, unit_s) = t.split_at(idx);
    let num: f64 = num_s
        .parse()
        .map_err(|e| format!("invalid duration number: {e}"))?;
    let unit = unit_s.trim().to_ascii_lowercase();
    let mult: f64 = match unit.as_str() {
        "ms" | "" => 1.0,
        "s" => 1000.0,
        "m" => 60_000.0,
        "h" => 3_600_000.0,
        _ => return Err(format!("unknown duration unit {unit_s:?} (use ms/s/m/h)")),
    };
    let ms = (num * mult).round();
    if !ms.is_finite() || ms > MAX_DURATION.as_millis() as f64 {
        return Err(format!("duration {s} exceeds the maximum of 365 days"));
    }
    Ok(Duration::from_millis(ms as u64))
}

fn invalid(path: &Path, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn validate_name(path: &Path, name: &str) -> Result<(), ConfigError> {
    let t = name.trim();
    if t.is_empty() {
        return Err(invalid(path, "process name must not be empty"));
    }
    if t != name || name.contains('/') || name.starts_with('.') {
        return Err(invalid(
            path,
            format!("process name {name:?} must not contain '/', surrounding whitespace or a leading '.'"),
        ));
    }
    Ok(())
}

/// Bare program names are left for `PATH` lookup; anything with a directory part is anchored
/// at the service root.
fn resolve_executable(layout: &RunLayout, exe: &Path) -> PathBuf {
    if exe.is_relative() && exe.components().count() == 1 {
        exe.to_path_buf()
    } else {
        layout.resolve(exe)
    }
}

struct ProcessFields {
    executable: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    dirs: Vec<PathBuf>,
    working_directory: Option<PathBuf>,
}

fn descriptor(
    path: &Path,
    layout: &RunLayout,
    name: String,
    output: PathBuf,
    p: ProcessFields,
) -> Result<ProcessDescriptor, ConfigError> {
    validate_name(path, &name)?;
    if p.executable.as_os_str().is_empty() {
        return Err(invalid(path, format!("{name}: executable must not be empty")));
    }
    let working_directory = p
        .working_directory
        .map(|wd| layout.resolve(&wd))
        .unwrap_or_else(|| layout.root().to_path_buf());
    Ok(ProcessDescriptor {
        command: CommandSpec {
            executable: resolve_executable(layout, &p.executable),
            args: p.args,
            env: p.env,
            working_directory,
        },
        output,
        dirs: p.dirs.iter().map(|d| layout.resolve(d)).collect(),
        name,
    })
}

pub fn parse_service_config(
    raw: &str,
    path: &Path,
    layout: &RunLayout,
) -> Result<ServiceConfig, ConfigError> {
    let file_cfg: LauncherConfigFile =
        serde_yaml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let svc = file_cfg.service;
    let primary_name = svc.name;
    let primary = descriptor(
        path,
        layout,
        primary_name.clone(),
        layout.primary_log(),
        ProcessFields {
            executable: svc.executable,
            args: svc.args,
            env: svc.env,
            dirs: svc.dirs,
            working_directory: svc.working_directory,
        },
    )?;

    let mut sub_processes = Vec::with_capacity(file_cfg.sub_processes.len());
    for (name, sp) in file_cfg.sub_processes {
        if name == primary_name {
            return Err(invalid(
                path,
                format!("sub-process {name:?} has the same name as the primary process"),
            ));
        }
        let output = layout.sub_process_log(&name);
        sub_processes.push(descriptor(
            path,
            layout,
            name,
            output,
            ProcessFields {
                executable: sp.executable,
                args: sp.args,
                env: sp.env,
                dirs: sp.dirs,
                working_directory: sp.working_directory,
            },
        )?);
    }

    let mut stop = StopSettings::default();
    if let Some(sup) = file_cfg.supervisor {
        if let Some(g) = sup.stop_grace_period {
            stop.grace_period = g;
        }
        if let Some(p) = sup.stop_poll_interval {
            if p.is_zero() {
                return Err(invalid(path, "supervisor.stop_poll_interval must be > 0"));
            }
            stop.poll_interval = p;
        }
    }

    Ok(ServiceConfig {
        primary,
        sub_processes,
        stop,
    })
}

pub fn load_service_config(path: &Path, layout: &RunLayout) -> Result<ServiceConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_service_config(&raw, path, layout)
}
