//! Filter configuration
//!
//! A filter is "these syscalls, inside this cgroup". It can come from a YAML
//! file, from command-line flags, or both:
//!
//! ```yaml
//! container_id: 4f1e2c3d9a8b...
//! block_syscalls:
//!   - mount
//!   - ptrace
//!   - "321"        # numbers are accepted too
//! block_privilege_escalation: true
//! file_paths:
//!   - /etc/shadow
//! ```
//!
//! When both are given, a non-empty value from the file wins and the flag
//! only fills gaps; `block_privilege_escalation` is on if either turns it
//! on. [`FilterConfig::resolve`] turns the result into a [`FilterPolicy`]:
//! a concrete cgroup id, syscall numbers and checked file paths.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use heimdall_common::{
    FilterKey, FilterRule, PathKey, MAX_FILTER_ENTRIES, MAX_PATH_BYTES, MAX_PATH_RULES,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cgroups::{self, CgroupError};
use crate::enforcement::{RuleStore, StoreError};
use crate::syscalls;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("unknown system call {0:?}")]
    UnknownSyscall(String),

    #[error("no target given: set a container id, pid, cgroup path or cgroup id")]
    MissingTarget,

    #[error("{count} rules requested but the filter holds at most {capacity}")]
    TooManyRules { count: usize, capacity: usize },

    #[error("cannot block file path {path:?}: {reason}")]
    InvalidFilePath { path: String, reason: &'static str },

    #[error(transparent)]
    Cgroup(#[from] CgroupError),
}

/// Raw filter settings as written by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilterConfig {
    /// Long container id, resolved to its cgroup
    pub container_id: Option<String>,
    /// cgroup directory, absolute or relative to /sys/fs/cgroup
    pub cgroup_path: Option<PathBuf>,
    /// cgroup id used as-is
    pub cgroup_id: Option<u64>,
    /// Running process whose cgroup is targeted
    pub pid: Option<u32>,
    /// Syscall names or numbers to block
    pub block_syscalls: Vec<String>,
    /// Deny setuid/setgid credential changes to non-root tasks
    pub block_privilege_escalation: bool,
    /// Absolute paths whose opening is denied
    pub file_paths: Vec<String>,
}

/// Where the rules apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    CgroupId(u64),
    CgroupPath(PathBuf),
    Pid(u32),
    Container(String),
}

impl Target {
    pub fn cgroup_id(&self) -> Result<u64, CgroupError> {
        match self {
            Target::CgroupId(id) => Ok(*id),
            Target::CgroupPath(path) => {
                let path = if path.is_absolute() {
                    path.clone()
                } else {
                    Path::new(cgroups::CGROUP_ROOT).join(path)
                };
                cgroups::cgroup_id_of_path(&path)
            }
            Target::Pid(pid) => cgroups::cgroup_id_of_pid(*pid),
            Target::Container(id) => cgroups::container_cgroup_id(id),
        }
    }
}

impl FilterConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        // An empty document deserializes as unit, not as an empty map
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let yaml = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Fill every empty field of `self` from `flags`.
    pub fn or_flags(self, flags: FilterConfig) -> Self {
        let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());
        Self {
            container_id: non_empty(self.container_id).or(non_empty(flags.container_id)),
            cgroup_path: self.cgroup_path.or(flags.cgroup_path),
            cgroup_id: self.cgroup_id.or(flags.cgroup_id),
            pid: self.pid.or(flags.pid),
            block_syscalls: if self.block_syscalls.is_empty() {
                flags.block_syscalls
            } else {
                self.block_syscalls
            },
            block_privilege_escalation: self.block_privilege_escalation
                || flags.block_privilege_escalation,
            file_paths: if self.file_paths.is_empty() {
                flags.file_paths
            } else {
                self.file_paths
            },
        }
    }

    /// Whether anything at all is to be blocked.
    pub fn has_filters(&self) -> bool {
        !self.block_syscalls.is_empty()
            || !self.file_paths.is_empty()
            || self.block_privilege_escalation
    }

    /// The most specific target configured: id, path, pid, then container.
    pub fn target(&self) -> Result<Target, ConfigError> {
        if let Some(id) = self.cgroup_id {
            return Ok(Target::CgroupId(id));
        }
        if let Some(path) = &self.cgroup_path {
            return Ok(Target::CgroupPath(path.clone()));
        }
        if let Some(pid) = self.pid {
            return Ok(Target::Pid(pid));
        }
        match &self.container_id {
            Some(id) if !id.is_empty() => Ok(Target::Container(id.clone())),
            _ => Err(ConfigError::MissingTarget),
        }
    }

    /// Syscall numbers to block, deduplicated, in the order given.
    pub fn syscall_numbers(&self) -> Result<Vec<u32>, ConfigError> {
        let mut numbers = Vec::with_capacity(self.block_syscalls.len());
        for name in &self.block_syscalls {
            let nr = syscalls::parse_syscall(name)
                .ok_or_else(|| ConfigError::UnknownSyscall(name.clone()))?;
            if !numbers.contains(&nr) {
                numbers.push(nr);
            }
        }
        let capacity = MAX_FILTER_ENTRIES as usize;
        if numbers.len() > capacity {
            return Err(ConfigError::TooManyRules {
                count: numbers.len(),
                capacity,
            });
        }
        Ok(numbers)
    }

    /// File paths to block, checked and deduplicated.
    ///
    /// Paths are matched byte for byte against the string a process hands
    /// to `open`, so they must be absolute and fit a kernel map key.
    pub fn blocked_paths(&self) -> Result<Vec<String>, ConfigError> {
        let mut paths: Vec<String> = Vec::with_capacity(self.file_paths.len());
        for path in &self.file_paths {
            let invalid = |reason| ConfigError::InvalidFilePath {
                path: path.clone(),
                reason,
            };
            if !path.starts_with('/') {
                return Err(invalid("path must be absolute"));
            }
            if path.len() > MAX_PATH_BYTES {
                return Err(invalid("path must be at most 62 bytes"));
            }
            if path.contains('\0') {
                return Err(invalid("path contains a NUL byte"));
            }
            if !paths.contains(path) {
                paths.push(path.clone());
            }
        }
        let capacity = MAX_PATH_RULES as usize;
        if paths.len() > capacity {
            return Err(ConfigError::TooManyRules {
                count: paths.len(),
                capacity,
            });
        }
        Ok(paths)
    }

    /// Resolve syscall names, paths and the target into a concrete policy.
    pub fn resolve(&self) -> Result<FilterPolicy, ConfigError> {
        let syscalls = self.syscall_numbers()?;
        let file_paths = self.blocked_paths()?;
        let cgroup_id = self.target()?.cgroup_id()?;
        Ok(FilterPolicy {
            container_id: self.container_id.clone().filter(|id| !id.is_empty()),
            cgroup_id,
            syscalls,
            block_privilege_escalation: self.block_privilege_escalation,
            file_paths,
        })
    }
}

/// Block rules for one cgroup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterPolicy {
    pub container_id: Option<String>,
    pub cgroup_id: u64,
    pub syscalls: Vec<u32>,
    pub block_privilege_escalation: bool,
    pub file_paths: Vec<String>,
}

impl FilterPolicy {
    /// Syscall rules only.
    pub fn syscalls(cgroup_id: u64, syscalls: Vec<u32>) -> Self {
        Self {
            container_id: None,
            cgroup_id,
            syscalls,
            block_privilege_escalation: false,
            file_paths: Vec::new(),
        }
    }

    /// Whether the LSM guard has anything to enforce.
    pub fn needs_guard(&self) -> bool {
        self.block_privilege_escalation || !self.file_paths.is_empty()
    }

    /// Path map keys; paths that do not fit a key are skipped.
    pub fn path_keys(&self) -> Vec<PathKey> {
        self.file_paths
            .iter()
            .filter_map(|path| PathKey::new(self.cgroup_id, path.as_bytes()))
            .collect()
    }

    pub fn keys(&self) -> Vec<FilterKey> {
        self.syscalls
            .iter()
            .map(|&nr| FilterKey::new(nr, self.cgroup_id))
            .collect()
    }

    /// Install every rule of this policy into `store`.
    pub fn install(&self, store: &RuleStore) -> Result<usize, StoreError> {
        for key in self.keys() {
            store.insert(key, FilterRule::BLOCK)?;
        }
        Ok(self.syscalls.len())
    }

    /// Remove this policy's rules from `store`, returning how many were present.
    pub fn uninstall(&self, store: &RuleStore) -> usize {
        self.keys()
            .iter()
            .filter(|key| store.remove(key).is_some())
            .count()
    }
}
