//! cgroup v2 lookup for rule targets
//!
//! Block rules are scoped by cgroup id, the same value the kernel program
//! reads with `bpf_get_current_cgroup_id()`. Users name a container, a
//! cgroup path or a running pid instead; this module turns those into ids.
//!
//! ```text
//! /sys/fs/cgroup/                              ← cgroup v2 root
//! └── system.slice/
//!     └── docker-<container id>.scope/         ← inode number = cgroup id
//! ```
//!
//! # Example Usage
//!
//! ```ignore
//! use heimdall::cgroups::{container_cgroup_id, cgroup_id_of_pid};
//!
//! let id = container_cgroup_id("4f1e2c3d...")?;
//! assert_eq!(id, cgroup_id_of_pid(container_init_pid)?);
//! ```

mod resolver;

pub use resolver::{
    cgroup_id_of_path, cgroup_id_of_pid, cgroup_id_of_pid_at, container_cgroup_id,
    find_container_cgroup, parse_unified_path, CgroupError, CGROUP_ROOT, PROC_ROOT,
};
