//! PID records and the on-disk layout they live in.
//!
//! One file per named process at `var/run/<name>.pid`, holding the decimal PID and nothing
//! else. Writes go through a temp file plus `rename` so a reader never sees a partial record.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

use crate::si::error::PidFileError;

const RUN_DIR: &str = "var/run";
const LOG_DIR: &str = "var/log";
const PRIMARY_LOG: &str = "startup.log";

/// Paths of everything the supervisor reads and writes, anchored at the service root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(RUN_DIR)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join(LOG_DIR)
    }

    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.run_dir().join(format!("{name}.pid"))
    }

    pub fn primary_log(&self) -> PathBuf {
        self.log_dir().join(PRIMARY_LOG)
    }

    pub fn sub_process_log(&self, name: &str) -> PathBuf {
        self.log_dir().join(format!("{name}-startup.log"))
    }

    /// Anchor a relative path at the service root; absolute paths pass through.
    pub fn resolve(&self, p: &Path) -> PathBuf {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}

/// `Ok(None)` when there is no record.
pub fn read_pid(path: &Path) -> Result<Option<Pid>, PidFileError> {
    let raw = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(PidFileError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let t = raw.trim();
    match t.parse::<i32>() {
        Ok(pid) if pid > 0 => Ok(Some(Pid::from_raw(pid))),
        _ => Err(PidFileError::Corrupt {
            path: path.to_path_buf(),
            content: t.to_string(),
        }),
    }
}

pub fn write_pid(path: &Path, pid: Pid) -> Result<(), PidFileError> {
    let io_err = |source: io::Error| PidFileError::Io {
        path: path.to_path_buf(),
        source,
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "pid".to_string());
    let tmp = parent.join(format!(".{file_name}.tmp.{}", std::process::id()));
    fs::write(&tmp, pid.as_raw().to_string()).map_err(io_err)?;
    // Atomic replace on POSIX.
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(io_err(e));
    }
    Ok(())
}

/// Removing a record that is already gone is not an error.
pub fn remove_pid(path: &Path) -> Result<(), PidFileError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(PidFileError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
