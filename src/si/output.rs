//! Startup log files that receive the launched processes' stdout/stderr.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Local;

const LOG_MODE: u32 = 0o644;

/// Tracks which logs this invocation already wrote to: the first open truncates, later
/// opens append.
#[derive(Debug, Default)]
pub struct OutputLogs {
    opened: Mutex<HashSet<PathBuf>>,
}

impl OutputLogs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, path: &Path) -> io::Result<File> {
        let first = {
            let mut g = self.opened.lock().unwrap_or_else(|p| p.into_inner());
            g.insert(path.to_path_buf())
        };
        open_log(path, first)
    }
}

fn open_log(path: &Path, truncate: bool) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut opts = OpenOptions::new();
    opts.create(true).mode(LOG_MODE);
    if truncate {
        opts.write(true).truncate(true);
    } else {
        opts.append(true);
    }
    opts.open(path)
}

/// Append one timestamped line. Never truncates, whatever the invocation opened before.
pub fn append_diagnostic(path: &Path, component: &str, msg: &str) -> io::Result<()> {
    let mut f = open_log(path, false)?;
    let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
    let mut line = format!("{ts} [{component}] {}", msg.trim_end());
    line.push('\n');
    f.write_all(line.as_bytes())
}
