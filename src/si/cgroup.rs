//! cgroup v1 resource detection.
//!
//! Resolution cross-references two kernel listings:
//! - `/proc/self/cgroup`: `hierarchy-id:subsystem[,subsystem...]:root-path` per line
//! - `/proc/self/mountinfo`: one mount per line, including the mount's root, its mount point,
//!   its options and (after the `-` separator) the super block options
//!
//! The subsystem's control files (`cpu.shares`, `memory.limit_in_bytes`) are then read from the
//! resolved mount directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use nix::sched::{CpuSet, sched_getaffinity};
use nix::unistd::Pid;
use tracing::debug;

use crate::si::error::CgroupError;
use crate::si::fsys::FileSystem;

pub const PROC_SELF_CGROUP: &str = "/proc/self/cgroup";
pub const PROC_SELF_MOUNTINFO: &str = "/proc/self/mountinfo";

pub const CPU_SUBSYSTEM: &str = "cpu";
pub const MEMORY_SUBSYSTEM: &str = "memory";

const CPU_SHARES_FILE: &str = "cpu.shares";
const MEMORY_LIMIT_FILE: &str = "memory.limit_in_bytes";

/// `cpu.shares` granted for one full core.
pub const SHARES_PER_CORE: u64 = 1024;

/// Parallelism floor advertised on multi-core hosts.
const MIN_MULTICORE_PROCESSORS: usize = 2;

/// A resolved subsystem mount for the current process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgroupMount {
    pub subsystem: String,
    /// Root path from the membership listing.
    pub hierarchy_root: String,
    pub mount_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Membership {
    pub(crate) hierarchy_id: String,
    pub(crate) subsystems: Vec<String>,
    pub(crate) root: String,
}

pub(crate) fn parse_proc_cgroup(s: &str) -> Vec<Membership> {
    let mut out = Vec::new();
    for line in s.lines() {
        let t = line.trim();
        if t.is_empty() {
            continue;
        }
        let mut parts = t.splitn(3, ':');
        let (Some(id), Some(subsystems), Some(root)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        out.push(Membership {
            hierarchy_id: id.to_string(),
            subsystems: split_list(subsystems),
            root: root.to_string(),
        });
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MountInfo {
    pub(crate) root: String,
    pub(crate) mount_point: PathBuf,
    /// Per-mount options followed by super block options.
    pub(crate) options: Vec<String>,
}

/// Parse `/proc/<pid>/mountinfo`. Lines with too few fields are skipped.
///
/// Field layout (see proc(5)):
/// `id parent major:minor root mount-point mount-options [optional...] - fstype source super-options`
pub(crate) fn parse_mountinfo(s: &str) -> Vec<MountInfo> {
    let mut out = Vec::new();
    for line in s.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        let mut options = split_list(fields[5]);
        if let Some(sep) = fields.iter().skip(6).position(|f| *f == "-") {
            if let Some(super_opts) = fields.get(6 + sep + 3) {
                options.extend(split_list(super_opts));
            }
        }
        out.push(MountInfo {
            root: unescape_octal(fields[3]),
            mount_point: PathBuf::from(unescape_octal(fields[4])),
            options,
        });
    }
    out
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(str::to_string)
        .collect()
}

/// mountinfo escapes space, tab, newline and backslash as `\ooo`.
fn unescape_octal(s: &str) -> String {
    if !s.contains('\\') {
        return s.to_string();
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let oct = std::str::from_utf8(&bytes[i + 1..i + 4]).ok();
            if let Some(v) = oct.and_then(|o| u8::from_str_radix(o, 8).ok()) {
                out.push(v);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// A composite mount directory such as `/sys/fs/cgroup/cpu,cpuacct` is addressed through the
/// per-subsystem sibling (`/sys/fs/cgroup/cpu`).
fn subsystem_dir(mount_point: &Path, subsystem: &str) -> PathBuf {
    let Some(base) = mount_point.file_name().and_then(|b| b.to_str()) else {
        return mount_point.to_path_buf();
    };
    if !base.contains(',') || !base.split(',').any(|c| c == subsystem) {
        return mount_point.to_path_buf();
    }
    match mount_point.parent() {
        Some(parent) => parent.join(subsystem),
        None => mount_point.to_path_buf(),
    }
}

/// Finds where a cgroup v1 subsystem of the current process is mounted.
#[derive(Debug, Clone)]
pub struct CgroupResolver {
    fs: Arc<dyn FileSystem>,
    cgroup_file: PathBuf,
    mountinfo_file: PathBuf,
}

impl CgroupResolver {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self::with_paths(fs, PROC_SELF_CGROUP, PROC_SELF_MOUNTINFO)
    }

    pub fn with_paths(
        fs: Arc<dyn FileSystem>,
        cgroup_file: impl Into<PathBuf>,
        mountinfo_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            fs,
            cgroup_file: cgroup_file.into(),
            mountinfo_file: mountinfo_file.into(),
        }
    }

    pub fn resolve_path(&self, subsystem: &str) -> Result<PathBuf, CgroupError> {
        Ok(self.resolve(subsystem)?.mount_path)
    }

    pub fn resolve(&self, subsystem: &str) -> Result<CgroupMount, CgroupError> {
        let memberships = parse_proc_cgroup(&self.read(&self.cgroup_file)?);
        let Some(membership) = memberships
            .iter()
            .find(|m| m.subsystems.iter().any(|s| s == subsystem))
        else {
            return Err(CgroupError::CGroupMountNotFound {
                subsystem: subsystem.to_string(),
            });
        };

        let mounts = parse_mountinfo(&self.read(&self.mountinfo_file)?);
        let found = mounts
            .iter()
            .filter(|m| m.root == membership.root)
            .find(|m| m.options.iter().any(|o| o == subsystem));
        let Some(mount) = found else {
            return Err(CgroupError::CGroupMountNotFound {
                subsystem: subsystem.to_string(),
            });
        };

        let mount_path = subsystem_dir(&mount.mount_point, subsystem);
        debug!(
            subsystem,
            hierarchy = %membership.hierarchy_id,
            root = %membership.root,
            mount = %mount_path.display(),
            "resolved cgroup mount"
        );
        Ok(CgroupMount {
            subsystem: subsystem.to_string(),
            hierarchy_root: membership.root.clone(),
            mount_path,
        })
    }

    fn read(&self, path: &Path) -> Result<String, CgroupError> {
        self.fs
            .read_to_string(path)
            .map_err(|source| CgroupError::CGroupFileUnreadable {
                path: path.to_path_buf(),
                source,
            })
    }

    fn file_system(&self) -> &dyn FileSystem {
        self.fs.as_ref()
    }
}

/// Number of CPUs this process may run on, per its affinity mask.
pub fn host_cores() -> usize {
    match sched_getaffinity(Pid::from_raw(0)) {
        Ok(set) => {
            let n = (0..CpuSet::count())
                .filter(|i| set.is_set(*i).unwrap_or(false))
                .count();
            n.max(1)
        }
        Err(e) => {
            debug!(error = %e, "sched_getaffinity failed; using available_parallelism");
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

/// Derives an effective processor count from the `cpu` subsystem's `cpu.shares`.
#[derive(Debug, Clone)]
pub struct ProcessorCountEstimator {
    resolver: CgroupResolver,
    host_cores: usize,
}

impl ProcessorCountEstimator {
    pub fn new(resolver: CgroupResolver) -> Self {
        Self::with_host_cores(resolver, host_cores())
    }

    pub fn with_host_cores(resolver: CgroupResolver, host_cores: usize) -> Self {
        Self {
            resolver,
            host_cores,
        }
    }

    pub fn processor_count(&self) -> Result<usize, CgroupError> {
        // Nothing to divide on a single-core host.
        if self.host_cores <= 1 {
            return Ok(1);
        }
        let shares = self.cpu_shares()?;
        let share_cores = usize::try_from(shares / SHARES_PER_CORE).unwrap_or(usize::MAX);
        Ok(share_cores
            .min(self.host_cores)
            .max(MIN_MULTICORE_PROCESSORS))
    }

    pub fn cpu_shares(&self) -> Result<u64, CgroupError> {
        let path = self.resolver.resolve_path(CPU_SUBSYSTEM)?.join(CPU_SHARES_FILE);
        let raw = self
            .resolver
            .file_system()
            .read_to_string(&path)
            .map_err(|source| CgroupError::CPUSharesUnreadable {
                path: path.clone(),
                source,
            })?;
        raw.trim()
            .parse::<u64>()
            .map_err(|_| CgroupError::CPUSharesMalformed {
                path,
                content: raw.trim().to_string(),
            })
    }
}

/// Reads the `memory` subsystem's ceiling.
#[derive(Debug, Clone)]
pub struct MemoryLimitReader {
    resolver: CgroupResolver,
}

impl MemoryLimitReader {
    pub fn new(resolver: CgroupResolver) -> Self {
        Self { resolver }
    }

    pub fn memory_limit_bytes(&self) -> Result<u64, CgroupError> {
        let path = self
            .resolver
            .resolve_path(MEMORY_SUBSYSTEM)?
            .join(MEMORY_LIMIT_FILE);
        let raw = self
            .resolver
            .file_system()
            .read_to_string(&path)
            .map_err(|source| CgroupError::MemoryLimitUnreadable {
                path: path.clone(),
                source,
            })?;
        raw.trim()
            .parse::<u64>()
            .map_err(|_| CgroupError::MemoryLimitMalformed {
                path,
                content: raw.trim().to_string(),
            })
    }
}
