//! Container -> cgroup id resolution
//!
//! On cgroup v2 the id the kernel reports from `bpf_get_current_cgroup_id()`
//! is the inode number of the cgroup's directory under `/sys/fs/cgroup`.
//! Resolving a container therefore means finding its directory and
//! stat-ing it.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Base path for cgroup v2 filesystem
pub const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// procfs mount point
pub const PROC_ROOT: &str = "/proc";

/// How deep below the root a container scope may sit.
/// kubepods nests pod and container levels under QoS slices.
const MAX_SEARCH_DEPTH: usize = 8;

/// Prefixes container runtimes put in front of the id in scope names
const SCOPE_PREFIXES: &[&str] = &["docker-", "cri-containerd-", "crio-", "libpod-"];

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("invalid container id {0:?}")]
    InvalidContainerId(String),

    #[error("no cgroup found for container {0}")]
    ContainerNotFound(String),

    #[error("{0} is not a cgroup directory")]
    NotADirectory(PathBuf),

    #[error("pid {0} is not in a cgroup v2 hierarchy")]
    NoUnifiedHierarchy(u32),

    #[error("I/O error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CgroupError + '_ {
    move |source| CgroupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// cgroup id of a cgroup directory.
pub fn cgroup_id_of_path(path: &Path) -> Result<u64, CgroupError> {
    let meta = fs::metadata(path).map_err(io_error(path))?;
    if !meta.is_dir() {
        return Err(CgroupError::NotADirectory(path.to_path_buf()));
    }
    Ok(meta.ino())
}

/// Whether a cgroup directory name belongs to `container_id`.
///
/// Matches `<id>` (cgroupfs driver) and `<runtime>-<id>.scope` (systemd driver).
fn is_container_dir(name: &str, container_id: &str) -> bool {
    if name == container_id {
        return true;
    }
    let Some(stem) = name.strip_suffix(".scope") else {
        return false;
    };
    SCOPE_PREFIXES
        .iter()
        .any(|prefix| stem.strip_prefix(prefix) == Some(container_id))
}

/// Find the cgroup directory of a container below `root`.
///
/// Breadth-first, so the shallowest match wins. Symlinks are not followed.
pub fn find_container_cgroup(root: &Path, container_id: &str) -> Result<PathBuf, CgroupError> {
    let valid = !container_id.is_empty()
        && container_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_');
    if !valid {
        return Err(CgroupError::InvalidContainerId(container_id.to_string()));
    }

    let mut queue = VecDeque::from([(root.to_path_buf(), 0usize)]);
    while let Some((dir, depth)) = queue.pop_front() {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            // The root must be readable; subtrees may vanish or be restricted
            Err(e) if depth == 0 => return Err(io_error(&dir)(e)),
            Err(_) => continue,
        };

        for entry in entries.flatten() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            let path = entry.path();
            if is_container_dir(&entry.file_name().to_string_lossy(), container_id) {
                return Ok(path);
            }
            if depth + 1 < MAX_SEARCH_DEPTH {
                queue.push_back((path, depth + 1));
            }
        }
    }

    Err(CgroupError::ContainerNotFound(container_id.to_string()))
}

/// cgroup id of a container, searched under the system cgroup root.
pub fn container_cgroup_id(container_id: &str) -> Result<u64, CgroupError> {
    let path = find_container_cgroup(Path::new(CGROUP_ROOT), container_id)?;
    tracing::debug!(container_id, path = %path.display(), "resolved container cgroup");
    cgroup_id_of_path(&path)
}

/// Extract the unified hierarchy path from `/proc/<pid>/cgroup` contents.
pub fn parse_unified_path(contents: &str) -> Option<&str> {
    contents
        .lines()
        .find_map(|line| line.strip_prefix("0::"))
        .map(str::trim)
        .filter(|path| path.starts_with('/'))
}

/// cgroup id of a running process.
pub fn cgroup_id_of_pid(pid: u32) -> Result<u64, CgroupError> {
    cgroup_id_of_pid_at(Path::new(PROC_ROOT), Path::new(CGROUP_ROOT), pid)
}

/// cgroup id of `pid`, reading `<proc_root>/<pid>/cgroup` and resolving the
/// unified path below `cgroup_root`.
pub fn cgroup_id_of_pid_at(
    proc_root: &Path,
    cgroup_root: &Path,
    pid: u32,
) -> Result<u64, CgroupError> {
    let proc_path = proc_root.join(pid.to_string()).join("cgroup");
    let contents = fs::read_to_string(&proc_path).map_err(io_error(&proc_path))?;
    let relative = parse_unified_path(&contents).ok_or(CgroupError::NoUnifiedHierarchy(pid))?;

    // "/.." would climb out of the cgroup mount
    if relative.split('/').any(|part| part == "..") {
        return Err(CgroupError::NoUnifiedHierarchy(pid));
    }
    let path = cgroup_root.join(relative.trim_start_matches('/'));
    tracing::debug!(pid, path = %path.display(), "resolved process cgroup");
    cgroup_id_of_path(&path)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "4f1e2c3d9a8b7c6d5e4f3a2b1c0d9e8f7a6b5c4d3e2f1a0b9c8d7e6f5a4b3c2d";

    #[test]
    fn test_is_container_dir() {
        assert!(is_container_dir(ID, ID));
        assert!(is_container_dir(&format!("docker-{}.scope", ID), ID));
        assert!(is_container_dir(&format!("cri-containerd-{}.scope", ID), ID));
        assert!(!is_container_dir(&format!("docker-{}", ID), ID));
        assert!(!is_container_dir(&format!("docker-{}x.scope", ID), ID));
        assert!(!is_container_dir("init.scope", ID));
    }

    #[test]
    fn test_find_systemd_scope() {
        let root = tempfile::tempdir().unwrap();
        let scope = root
            .path()
            .join("system.slice")
            .join(format!("docker-{}.scope", ID));
        fs::create_dir_all(&scope).unwrap();
        fs::create_dir_all(root.path().join("user.slice/user-1000.slice")).unwrap();

        let found = find_container_cgroup(root.path(), ID).unwrap();
        assert_eq!(found, scope);
        assert_eq!(
            cgroup_id_of_path(&found).unwrap(),
            fs::metadata(&scope).unwrap().ino()
        );
    }

    #[test]
    fn test_find_cgroupfs_layout() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("docker").join(ID);
        fs::create_dir_all(&dir).unwrap();

        assert_eq!(find_container_cgroup(root.path(), ID).unwrap(), dir);
    }

    #[test]
    fn test_not_found() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("system.slice")).unwrap();

        assert!(matches!(
            find_container_cgroup(root.path(), ID),
            Err(CgroupError::ContainerNotFound(_))
        ));
    }

    #[test]
    fn test_search_depth_is_bounded() {
        let root = tempfile::tempdir().unwrap();
        let mut deep = root.path().to_path_buf();
        for i in 0..MAX_SEARCH_DEPTH {
            deep = deep.join(format!("level{}", i));
        }
        fs::create_dir_all(deep.join(ID)).unwrap();

        assert!(matches!(
            find_container_cgroup(root.path(), ID),
            Err(CgroupError::ContainerNotFound(_))
        ));
    }

    #[test]
    fn test_rejects_invalid_container_id() {
        let root = tempfile::tempdir().unwrap();
        for bad in ["", "../etc", "a/b", "id with space"] {
            assert!(matches!(
                find_container_cgroup(root.path(), bad),
                Err(CgroupError::InvalidContainerId(_))
            ));
        }
    }

    #[test]
    fn test_missing_root_is_io_error() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("nope");
        assert!(matches!(
            find_container_cgroup(&missing, ID),
            Err(CgroupError::Io { .. })
        ));
    }

    #[test]
    fn test_file_is_not_a_cgroup() {
        let root = tempfile::tempdir().unwrap();
        let file = root.path().join("cgroup.procs");
        fs::write(&file, "").unwrap();

        assert!(matches!(
            cgroup_id_of_path(&file),
            Err(CgroupError::NotADirectory(_))
        ));
    }

    /// Fake `/proc/<pid>/cgroup` next to a fake cgroup tree.
    fn fake_host(pid: u32, cgroup_file: &str) -> (tempfile::TempDir, PathBuf, PathBuf) {
        let host = tempfile::tempdir().unwrap();
        let proc_root = host.path().join("proc");
        let cgroup_root = host.path().join("cgroup");
        fs::create_dir_all(proc_root.join(pid.to_string())).unwrap();
        fs::write(proc_root.join(pid.to_string()).join("cgroup"), cgroup_file).unwrap();
        fs::create_dir_all(&cgroup_root).unwrap();
        (host, proc_root, cgroup_root)
    }

    #[test]
    fn test_cgroup_id_of_pid() {
        let scope = format!("system.slice/docker-{}.scope", ID);
        let (_host, proc_root, cgroup_root) =
            fake_host(4242, &format!("0::/{}\n", scope));
        fs::create_dir_all(cgroup_root.join(&scope)).unwrap();

        let id = cgroup_id_of_pid_at(&proc_root, &cgroup_root, 4242).unwrap();
        assert_eq!(id, fs::metadata(cgroup_root.join(&scope)).unwrap().ino());
        assert_eq!(
            id,
            container_cgroup_id_at(&cgroup_root, ID),
            "a container's init pid and its id resolve to the same cgroup"
        );
    }

    #[test]
    fn test_cgroup_id_of_pid_root_cgroup() {
        let (_host, proc_root, cgroup_root) = fake_host(1, "0::/\n");
        assert_eq!(
            cgroup_id_of_pid_at(&proc_root, &cgroup_root, 1).unwrap(),
            fs::metadata(&cgroup_root).unwrap().ino()
        );
    }

    #[test]
    fn test_cgroup_id_of_pid_v1_only() {
        let (_host, proc_root, cgroup_root) = fake_host(7, "12:memory:/docker/abc\n");
        assert!(matches!(
            cgroup_id_of_pid_at(&proc_root, &cgroup_root, 7),
            Err(CgroupError::NoUnifiedHierarchy(7))
        ));
    }

    #[test]
    fn test_cgroup_id_of_pid_rejects_parent_components() {
        let (_host, proc_root, cgroup_root) = fake_host(8, "0::/../proc\n");
        assert!(matches!(
            cgroup_id_of_pid_at(&proc_root, &cgroup_root, 8),
            Err(CgroupError::NoUnifiedHierarchy(8))
        ));
    }

    #[test]
    fn test_cgroup_id_of_missing_pid() {
        let (_host, proc_root, cgroup_root) = fake_host(1, "0::/\n");
        assert!(matches!(
            cgroup_id_of_pid_at(&proc_root, &cgroup_root, 99),
            Err(CgroupError::Io { .. })
        ));
    }

    #[test]
    fn test_cgroup_id_of_own_pid() {
        // Only meaningful on a cgroup v2 host
        let Ok(contents) = fs::read_to_string("/proc/self/cgroup") else {
            return;
        };
        if parse_unified_path(&contents).is_none() || !Path::new(CGROUP_ROOT).is_dir() {
            return;
        }
        if let Ok(id) = cgroup_id_of_pid(std::process::id()) {
            assert!(id > 0);
        }
    }

    fn container_cgroup_id_at(root: &Path, container_id: &str) -> u64 {
        cgroup_id_of_path(&find_container_cgroup(root, container_id).unwrap()).unwrap()
    }

    #[test]
    fn test_parse_unified_path() {
        let v2 = "0::/system.slice/docker-abc.scope\n";
        assert_eq!(parse_unified_path(v2), Some("/system.slice/docker-abc.scope"));

        let hybrid = "12:memory:/docker/abc\n1:name=systemd:/docker/abc\n0::/docker/abc\n";
        assert_eq!(parse_unified_path(hybrid), Some("/docker/abc"));

        let v1_only = "12:memory:/docker/abc\n";
        assert_eq!(parse_unified_path(v1_only), None);
    }
}
