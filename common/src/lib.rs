//! Record layouts shared by the Heimdall kernel program and userspace
//!
//! Everything in here crosses the kernel/user boundary as raw bytes, so every
//! struct is `#[repr(C)]` with explicit padding fields. Padding is always
//! zeroed: `FilterKey` is hashed byte-for-byte by the BPF hash map, and a
//! stray byte in the hole between `syscall_nr` and `cgroup_id` would make an
//! otherwise identical key miss.
//!
//! ```text
//! FilterKey (16 bytes)          EventRecord (40 bytes)
//! ┌────────────┬──────┐         ┌─────┬─────┬────────────┬──────┐
//! │ syscall_nr │ _pad │         │ pid │ uid │ syscall_nr │ _pad │
//! ├────────────┴──────┤         ├─────┴─────┴────────────┴──────┤
//! │     cgroup_id     │         │           cgroup_id           │
//! └───────────────────┘         ├───────────────────────────────┤
//!                               │          comm[16]             │
//!                               └───────────────────────────────┘
//! ```
//!
//! The LSM guard object adds `PathKey` (72 bytes: `cgroup_id` then a
//! NUL-padded 64-byte path) and a few per-cgroup flag maps.

#![no_std]

/// Capacity of the filter rule map
pub const MAX_FILTER_ENTRIES: u32 = 1024;

/// Length of a task's command name, including the trailing NUL
pub const TASK_COMM_LEN: usize = 16;

/// Signal sent to a process that hits a block rule
pub const SIGKILL: u32 = 9;

/// Name of the kprobe program inside the object file
pub const PROGRAM_NAME: &str = "sys_call_block";

/// Kernel symbol the kprobe attaches to (x86_64 syscall dispatcher)
pub const ATTACH_SYMBOL: &str = "x64_sys_call";

/// BPF map: FilterKey -> FilterRule
pub const FILTER_MAP: &str = "FILTER_MAP";

/// BPF map: perf event array carrying EventRecords
pub const EVENTS_MAP: &str = "SYSCALL_EVENTS";

/// BPF map: per-CPU scratch slot for staging an EventRecord
pub const SCRATCH_MAP: &str = "PROCESS_INFO_MAP";

// ─────────────────────────────────────────────────────────────────────────────
// LSM guard (file access and privilege escalation)
// ─────────────────────────────────────────────────────────────────────────────

/// Bytes of path compared by the file guard, including the trailing NUL
pub const PATH_LEN: usize = 64;

/// Longest blockable path. One byte shorter than what fits a key, so a
/// longer path cut short by the kernel's string read never equals a rule.
pub const MAX_PATH_BYTES: usize = PATH_LEN - 2;

/// Capacity of the blocked path map
pub const MAX_PATH_RULES: u32 = 256;

/// Capacity of the per-cgroup flag maps
pub const MAX_GUARDED_CGROUPS: u32 = 64;

/// Capacity of the task -> pending denial map
pub const MAX_PENDING_DENIALS: u32 = 10240;

/// kprobe that matches open-family path arguments
pub const FILE_MARK_PROGRAM: &str = "file_open_mark";

/// LSM program on `file_open`
pub const FILE_CHECK_PROGRAM: &str = "file_open_check";

/// LSM program on `task_fix_setuid`
pub const SETUID_PROGRAM: &str = "task_fix_setuid_check";

/// LSM program on `task_fix_setgid`
pub const SETGID_PROGRAM: &str = "task_fix_setgid_check";

/// BPF map: PathKey -> 1
pub const PATH_RULES_MAP: &str = "PATH_RULES";

/// BPF map: cgroup id -> 1, cgroups with at least one path rule
pub const PATH_CGROUPS_MAP: &str = "PATH_CGROUPS";

/// BPF map: pid_tgid -> 1, open calls waiting to be denied
pub const PENDING_MAP: &str = "PENDING_DENY";

/// BPF map: cgroup id -> 1, cgroups where credential changes are denied
pub const PRIV_CGROUPS_MAP: &str = "PRIV_CGROUPS";

/// BPF map: per-CPU denial counters indexed by `DENY_*`
pub const DENIALS_MAP: &str = "DENIAL_COUNTS";

/// Denial counter slot for blocked opens
pub const DENY_FILE_OPEN: u32 = 0;

/// Denial counter slot for blocked credential changes
pub const DENY_PRIVILEGE: u32 = 1;

/// Number of denial counter slots
pub const DENIAL_KINDS: u32 = 2;

/// Returned by the file guard
pub const EACCES: i32 = 13;

/// Returned by the privilege guard
pub const EPERM: i32 = 1;

/// x86_64 numbers of the syscalls that open a path
pub const SYS_OPEN: u32 = 2;
pub const SYS_CREAT: u32 = 85;
pub const SYS_OPENAT: u32 = 257;
pub const SYS_OPENAT2: u32 = 437;

/// Which syscall argument carries the path of an open-family syscall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PathArg {
    /// `open`, `creat`: first argument (rdi)
    First,
    /// `openat`, `openat2`: second argument (rsi)
    Second,
}

/// Path argument position for `syscall_nr`, or `None` if it opens nothing.
pub const fn open_path_arg(syscall_nr: u32) -> Option<PathArg> {
    match syscall_nr {
        SYS_OPEN | SYS_CREAT => Some(PathArg::First),
        SYS_OPENAT | SYS_OPENAT2 => Some(PathArg::Second),
        _ => None,
    }
}

/// Identity of one block rule: a syscall number inside one cgroup.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterKey {
    pub syscall_nr: u32,
    _pad: u32,
    pub cgroup_id: u64,
}

impl FilterKey {
    pub const fn new(syscall_nr: u32, cgroup_id: u64) -> Self {
        Self {
            syscall_nr,
            _pad: 0,
            cgroup_id,
        }
    }
}

/// Value stored for a block rule.
///
/// Presence of the key is the whole rule today. The byte is reserved so
/// per-rule policy can be added without changing the map's value size.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FilterRule {
    reserved: u8,
}

impl FilterRule {
    /// The only rule kind: kill the caller.
    pub const BLOCK: Self = Self { reserved: 0 };
}

/// One confirmed enforcement, as delivered to userspace.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventRecord {
    pub pid: u32,
    pub uid: u32,
    pub syscall_nr: u32,
    _pad: u32,
    pub cgroup_id: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

impl EventRecord {
    /// All-zero record, used to provision scratch slots.
    pub const fn zeroed() -> Self {
        Self {
            pid: 0,
            uid: 0,
            syscall_nr: 0,
            _pad: 0,
            cgroup_id: 0,
            comm: [0u8; TASK_COMM_LEN],
        }
    }

    /// Overwrite every field of the record in place.
    ///
    /// The slot is reused across invocations, so nothing from the previous
    /// occupant may survive: padding is cleared too.
    #[inline(always)]
    pub fn fill(
        &mut self,
        pid: u32,
        uid: u32,
        syscall_nr: u32,
        cgroup_id: u64,
        comm: [u8; TASK_COMM_LEN],
    ) {
        self.pid = pid;
        self.uid = uid;
        self.syscall_nr = syscall_nr;
        self._pad = 0;
        self.cgroup_id = cgroup_id;
        self.comm = comm;
    }

    /// Command name bytes up to the first NUL.
    pub fn comm_bytes(&self) -> &[u8] {
        let end = self
            .comm
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TASK_COMM_LEN);
        &self.comm[..end]
    }

    /// The rule key this record was enforced under.
    pub const fn key(&self) -> FilterKey {
        FilterKey::new(self.syscall_nr, self.cgroup_id)
    }
}

impl Default for EventRecord {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Identity of one blocked path inside one cgroup.
///
/// The path is compared byte for byte as the caller passed it to `open`,
/// NUL-padded to `PATH_LEN`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PathKey {
    pub cgroup_id: u64,
    pub path: [u8; PATH_LEN],
}

impl PathKey {
    /// Key with an all-zero path, filled in place by the kernel program.
    pub const fn zeroed(cgroup_id: u64) -> Self {
        Self {
            cgroup_id,
            path: [0u8; PATH_LEN],
        }
    }

    /// Build a key from a path.
    ///
    /// Returns `None` for an empty path, one with an embedded NUL, or one
    /// longer than `MAX_PATH_BYTES`.
    pub fn new(cgroup_id: u64, path: &[u8]) -> Option<Self> {
        if path.is_empty() || path.len() > MAX_PATH_BYTES || path.contains(&0) {
            return None;
        }
        let mut key = Self::zeroed(cgroup_id);
        key.path[..path.len()].copy_from_slice(path);
        Some(key)
    }

    /// Path bytes up to the first NUL.
    pub fn path_bytes(&self) -> &[u8] {
        let end = self.path.iter().position(|&b| b == 0).unwrap_or(PATH_LEN);
        &self.path[..end]
    }
}

/// Copy a command name into the fixed comm field.
///
/// Mirrors the kernel's `get_task_comm`: at most 15 bytes are kept and the
/// last byte is always NUL. The name also stops at an embedded NUL.
pub fn comm_from_bytes(name: &[u8]) -> [u8; TASK_COMM_LEN] {
    let mut comm = [0u8; TASK_COMM_LEN];
    let mut i = 0;
    while i < TASK_COMM_LEN - 1 && i < name.len() && name[i] != 0 {
        comm[i] = name[i];
        i += 1;
    }
    comm
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for FilterKey {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for FilterRule {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for EventRecord {}

#[cfg(feature = "user")]
unsafe impl aya::Pod for PathKey {}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::size_of;

    #[test]
    fn test_layout_sizes() {
        assert_eq!(size_of::<FilterKey>(), 16);
        assert_eq!(size_of::<FilterRule>(), 1);
        assert_eq!(size_of::<EventRecord>(), 40);
        assert_eq!(size_of::<PathKey>(), 72);
    }

    #[test]
    fn test_path_key_padding() {
        let key = PathKey::new(500, b"/etc/shadow").unwrap();
        assert_eq!(key.path_bytes(), b"/etc/shadow");
        assert!(key.path[11..].iter().all(|&b| b == 0));
        assert_eq!(key, PathKey::new(500, b"/etc/shadow").unwrap());
        assert_ne!(key, PathKey::new(501, b"/etc/shadow").unwrap());
    }

    #[test]
    fn test_path_key_rejects_unmatchable_paths() {
        assert!(PathKey::new(1, b"").is_none());
        assert!(PathKey::new(1, b"/etc/\0shadow").is_none());
        assert!(PathKey::new(1, &[b'a'; PATH_LEN]).is_none());
        assert!(PathKey::new(1, &[b'a'; PATH_LEN - 1]).is_none());
        assert!(PathKey::new(1, &[b'a'; MAX_PATH_BYTES]).is_some());
    }

    #[test]
    fn test_open_path_arg() {
        assert_eq!(open_path_arg(SYS_OPEN), Some(PathArg::First));
        assert_eq!(open_path_arg(SYS_CREAT), Some(PathArg::First));
        assert_eq!(open_path_arg(SYS_OPENAT), Some(PathArg::Second));
        assert_eq!(open_path_arg(SYS_OPENAT2), Some(PathArg::Second));
        assert_eq!(open_path_arg(0), None);
        assert_eq!(open_path_arg(59), None);
    }

    #[test]
    fn test_comm_truncated_and_terminated() {
        let comm = comm_from_bytes(b"a-very-long-process-name");
        assert_eq!(&comm[..15], b"a-very-long-pro");
        assert_eq!(comm[15], 0);
    }

    #[test]
    fn test_comm_stops_at_nul() {
        let comm = comm_from_bytes(b"sh\0garbage");
        assert_eq!(&comm[..3], b"sh\0");
        assert!(comm[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_fill_overwrites_previous_record() {
        let mut record = EventRecord::zeroed();
        record.fill(10, 20, 62, 500, comm_from_bytes(b"first-command"));
        record.fill(11, 21, 59, 501, comm_from_bytes(b"sh"));

        assert_eq!(record.pid, 11);
        assert_eq!(record.uid, 21);
        assert_eq!(record.key(), FilterKey::new(59, 501));
        assert_eq!(record.comm_bytes(), b"sh");
    }
}
