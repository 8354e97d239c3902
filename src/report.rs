//! Human and machine readable output
//!
//! [`EnforcementEvent`] is the decoded form of one kernel `EventRecord`,
//! ready for logs or JSON lines. [`DryRun`] renders what a policy would do
//! without touching the kernel.

use std::fmt;

use heimdall_common::EventRecord;
use serde::Serialize;

use crate::config::FilterPolicy;
use crate::syscalls;

/// One confirmed kill, decoded for output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnforcementEvent {
    pub pid: u32,
    pub uid: u32,
    pub syscall_nr: u32,
    pub syscall: String,
    pub cgroup_id: u64,
    pub comm: String,
}

impl EnforcementEvent {
    pub fn from_record(record: &EventRecord) -> Self {
        Self {
            pid: record.pid,
            uid: record.uid,
            syscall_nr: record.syscall_nr,
            syscall: syscalls::display_name(record.syscall_nr),
            cgroup_id: record.cgroup_id,
            comm: String::from_utf8_lossy(record.comm_bytes()).into_owned(),
        }
    }

    /// Emit the event as a structured log line.
    pub fn log(&self) {
        tracing::warn!(
            pid = self.pid,
            uid = self.uid,
            syscall = %self.syscall,
            syscall_nr = self.syscall_nr,
            cgroup_id = self.cgroup_id,
            comm = %self.comm,
            "blocked syscall, process killed"
        );
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Preview of a policy, printed instead of loading anything.
pub struct DryRun<'a>(pub &'a FilterPolicy);

impl fmt::Display for DryRun<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let policy = self.0;
        writeln!(f, "Dry run mode enabled. The following actions would be taken:")?;
        writeln!(f)?;
        for &nr in &policy.syscalls {
            match syscalls::syscall_name(nr) {
                Some(name) => writeln!(f, "Block system call: {} (Number: {})", name, nr)?,
                None => writeln!(f, "Block system call: <unknown> (Number: {})", nr)?,
            }
        }
        if policy.block_privilege_escalation {
            writeln!(f, "Block privilege escalation attempts")?;
        }
        if !policy.file_paths.is_empty() {
            writeln!(
                f,
                "Block file access for paths: [{}]",
                policy.file_paths.join(" ")
            )?;
        }
        writeln!(f)?;
        writeln!(f, "Note: No changes will be made to the system.")?;
        if let Some(id) = &policy.container_id {
            writeln!(f, "Container ID: {}", id)?;
        }
        write!(f, "Cgroup ID: {}", policy.cgroup_id)
    }
}
