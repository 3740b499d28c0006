//! Read-only file access used by the cgroup readers.
//!
//! The readers never touch `std::fs` directly; they take a [`FileSystem`] so tests can
//! serve `/proc/self/cgroup`, `/proc/self/mountinfo` and control files from memory.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

pub trait FileSystem: Send + Sync + fmt::Debug {
    fn read_to_string(&self, path: &Path) -> io::Result<String>;
}

/// The host filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFs;

impl FileSystem for OsFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        fs::read_to_string(path)
    }
}

/// In-memory files keyed by absolute path. Clones share the same contents.
#[derive(Debug, Clone, Default)]
pub struct MemFs {
    files: Arc<Mutex<HashMap<PathBuf, String>>>,
}

impl MemFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<PathBuf>, content: impl Into<String>) -> Self {
        self.insert(path, content);
        self
    }

    pub fn insert(&self, path: impl Into<PathBuf>, content: impl Into<String>) {
        let mut g = self.files.lock().unwrap_or_else(|p| p.into_inner());
        g.insert(path.into(), content.into());
    }

    pub fn remove(&self, path: &Path) {
        let mut g = self.files.lock().unwrap_or_else(|p| p.into_inner());
        g.remove(path);
    }
}

impl FileSystem for MemFs {
    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let g = self.files.lock().unwrap_or_else(|p| p.into_inner());
        g.get(path).cloned().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("{}: no such file", path.display()),
            )
        })
    }
}
