//! x86_64 syscall table
//!
//! Block rules are keyed by syscall number, but people write syscall names.
//! The numbers here are the x86_64 ABI numbers the kprobe on `x64_sys_call`
//! sees, independent of the architecture this binary was built for.

/// Syscalls 0..=334, indexed by number
const LEGACY_TABLE: [&str; 335] = [
    "read", "write", "open", "close", "stat", "fstat", "lstat", "poll", "lseek", "mmap",
    "mprotect", "munmap", "brk", "rt_sigaction", "rt_sigprocmask", "rt_sigreturn", "ioctl",
    "pread64", "pwrite64", "readv", "writev", "access", "pipe", "select", "sched_yield",
    "mremap", "msync", "mincore", "madvise", "shmget", "shmat", "shmctl", "dup", "dup2",
    "pause", "nanosleep", "getitimer", "alarm", "setitimer", "getpid", "sendfile", "socket",
    "connect", "accept", "sendto", "recvfrom", "sendmsg", "recvmsg", "shutdown", "bind",
    "listen", "getsockname", "getpeername", "socketpair", "setsockopt", "getsockopt", "clone",
    "fork", "vfork", "execve", "exit", "wait4", "kill", "uname", "semget", "semop", "semctl",
    "shmdt", "msgget", "msgsnd", "msgrcv", "msgctl", "fcntl", "flock", "fsync", "fdatasync",
    "truncate", "ftruncate", "getdents", "getcwd", "chdir", "fchdir", "rename", "mkdir",
    "rmdir", "creat", "link", "unlink", "symlink", "readlink", "chmod", "fchmod", "chown",
    "fchown", "lchown", "umask", "gettimeofday", "getrlimit", "getrusage", "sysinfo", "times",
    "ptrace", "getuid", "syslog", "getgid", "setuid", "setgid", "geteuid", "getegid",
    "setpgid", "getppid", "getpgrp", "setsid", "setreuid", "setregid", "getgroups",
    "setgroups", "setresuid", "getresuid", "setresgid", "getresgid", "getpgid", "setfsuid",
    "setfsgid", "getsid", "capget", "capset", "rt_sigpending", "rt_sigtimedwait",
    "rt_sigqueueinfo", "rt_sigsuspend", "sigaltstack", "utime", "mknod", "uselib",
    "personality", "ustat", "statfs", "fstatfs", "sysfs", "getpriority", "setpriority",
    "sched_setparam", "sched_getparam", "sched_setscheduler", "sched_getscheduler",
    "sched_get_priority_max", "sched_get_priority_min", "sched_rr_get_interval", "mlock",
    "munlock", "mlockall", "munlockall", "vhangup", "modify_ldt", "pivot_root", "_sysctl",
    "prctl", "arch_prctl", "adjtimex", "setrlimit", "chroot", "sync", "acct", "settimeofday",
    "mount", "umount2", "swapon", "swapoff", "reboot", "sethostname", "setdomainname", "iopl",
    "ioperm", "create_module", "init_module", "delete_module", "get_kernel_syms",
    "query_module", "quotactl", "nfsservctl", "getpmsg", "putpmsg", "afs_syscall", "tuxcall",
    "security", "gettid", "readahead", "setxattr", "lsetxattr", "fsetxattr", "getxattr",
    "lgetxattr", "fgetxattr", "listxattr", "llistxattr", "flistxattr", "removexattr",
    "lremovexattr", "fremovexattr", "tkill", "time", "futex", "sched_setaffinity",
    "sched_getaffinity", "set_thread_area", "io_setup", "io_destroy", "io_getevents",
    "io_submit", "io_cancel", "get_thread_area", "lookup_dcookie", "epoll_create",
    "epoll_ctl_old", "epoll_wait_old", "remap_file_pages", "getdents64", "set_tid_address",
    "restart_syscall", "semtimedop", "fadvise64", "timer_create", "timer_settime",
    "timer_gettime", "timer_getoverrun", "timer_delete", "clock_settime", "clock_gettime",
    "clock_getres", "clock_nanosleep", "exit_group", "epoll_wait", "epoll_ctl", "tgkill",
    "utimes", "vserver", "mbind", "set_mempolicy", "get_mempolicy", "mq_open", "mq_unlink",
    "mq_timedsend", "mq_timedreceive", "mq_notify", "mq_getsetattr", "kexec_load", "waitid",
    "add_key", "request_key", "keyctl", "ioprio_set", "ioprio_get", "inotify_init",
    "inotify_add_watch", "inotify_rm_watch", "migrate_pages", "openat", "mkdirat", "mknodat",
    "fchownat", "futimesat", "newfstatat", "unlinkat", "renameat", "linkat", "symlinkat",
    "readlinkat", "fchmodat", "faccessat", "pselect6", "ppoll", "unshare", "set_robust_list",
    "get_robust_list", "splice", "tee", "sync_file_range", "vmsplice", "move_pages",
    "utimensat", "epoll_pwait", "signalfd", "timerfd_create", "eventfd", "fallocate",
    "timerfd_settime", "timerfd_gettime", "accept4", "signalfd4", "eventfd2", "epoll_create1",
    "dup3", "pipe2", "inotify_init1", "preadv", "pwritev", "rt_tgsigqueueinfo",
    "perf_event_open", "recvmmsg", "fanotify_init", "fanotify_mark", "prlimit64",
    "name_to_handle_at", "open_by_handle_at", "clock_adjtime", "syncfs", "sendmmsg", "setns",
    "getcpu", "process_vm_readv", "process_vm_writev", "kcmp", "finit_module",
    "sched_setattr", "sched_getattr", "renameat2", "seccomp", "getrandom", "memfd_create",
    "kexec_file_load", "bpf", "execveat", "userfaultfd", "membarrier", "mlock2",
    "copy_file_range", "preadv2", "pwritev2", "pkey_mprotect", "pkey_alloc", "pkey_free",
    "statx", "io_pgetevents", "rseq",
];

/// First number of the unified syscall range shared by all architectures
const UNIFIED_BASE: u32 = 424;

/// Syscalls 424.., indexed by number - UNIFIED_BASE
const UNIFIED_TABLE: [&str; 39] = [
    "pidfd_send_signal", "io_uring_setup", "io_uring_enter", "io_uring_register", "open_tree",
    "move_mount", "fsopen", "fsconfig", "fsmount", "fspick", "pidfd_open", "clone3",
    "close_range", "openat2", "pidfd_getfd", "faccessat2", "process_madvise", "epoll_pwait2",
    "mount_setattr", "quotactl_fd", "landlock_create_ruleset", "landlock_add_rule",
    "landlock_restrict_self", "memfd_secret", "process_mrelease", "futex_waitv",
    "set_mempolicy_home_node", "cachestat", "fchmodat2", "map_shadow_stack", "futex_wake",
    "futex_wait", "futex_requeue", "statmount", "listmount", "lsm_get_self_attr",
    "lsm_set_self_attr", "lsm_list_modules", "mseal",
];

/// Look up the name of an x86_64 syscall number.
pub fn syscall_name(nr: u32) -> Option<&'static str> {
    if let Some(&name) = LEGACY_TABLE.get(nr as usize) {
        return Some(name);
    }
    nr.checked_sub(UNIFIED_BASE)
        .and_then(|i| UNIFIED_TABLE.get(i as usize))
        .copied()
}

/// Look up the x86_64 number of a syscall by name.
///
/// A `sys_` prefix is accepted, so `sys_kill` and `kill` are the same.
pub fn syscall_number(name: &str) -> Option<u32> {
    let name = name.strip_prefix("sys_").unwrap_or(name);
    if let Some(i) = LEGACY_TABLE.iter().position(|&n| n == name) {
        return Some(i as u32);
    }
    UNIFIED_TABLE
        .iter()
        .position(|&n| n == name)
        .map(|i| UNIFIED_BASE + i as u32)
}

/// Name for logs and metric labels; unknown numbers become `syscall_<nr>`.
pub fn display_name(nr: u32) -> String {
    match syscall_name(nr) {
        Some(name) => name.to_string(),
        None => format!("syscall_{}", nr),
    }
}

/// Parse a syscall given either by name or by decimal number.
///
/// Numbers are accepted even when they are not in the table, since newer
/// kernels add syscalls faster than tables get updated.
pub fn parse_syscall(input: &str) -> Option<u32> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if input.bytes().all(|b| b.is_ascii_digit()) {
        return input.parse().ok();
    }
    syscall_number(&input.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syscall_name() {
        assert_eq!(syscall_name(0), Some("read"));
        assert_eq!(syscall_name(59), Some("execve"));
        assert_eq!(syscall_name(62), Some("kill"));
        assert_eq!(syscall_name(101), Some("ptrace"));
        assert_eq!(syscall_name(334), Some("rseq"));
        assert_eq!(syscall_name(335), None);
        assert_eq!(syscall_name(435), Some("clone3"));
        assert_eq!(syscall_name(462), Some("mseal"));
        assert_eq!(syscall_name(463), None);
    }

    #[test]
    fn test_syscall_number() {
        assert_eq!(syscall_number("kill"), Some(62));
        assert_eq!(syscall_number("sys_kill"), Some(62));
        assert_eq!(syscall_number("openat"), Some(257));
        assert_eq!(syscall_number("bpf"), Some(321));
        assert_eq!(syscall_number("io_uring_setup"), Some(425));
        assert_eq!(syscall_number("not_a_syscall"), None);
    }

    #[test]
    fn test_tables_round_trip() {
        for nr in (0..335).chain(424..463) {
            let name = syscall_name(nr).unwrap();
            assert_eq!(syscall_number(name), Some(nr), "{}", name);
        }
    }

    #[test]
    fn test_display_name() {
        assert_eq!(display_name(1), "write");
        assert_eq!(display_name(9999), "syscall_9999");
    }

    #[test]
    fn test_parse_syscall() {
        assert_eq!(parse_syscall("mount"), Some(165));
        assert_eq!(parse_syscall(" Mount "), Some(165));
        assert_eq!(parse_syscall("62"), Some(62));
        assert_eq!(parse_syscall("500"), Some(500));
        assert_eq!(parse_syscall(""), None);
        assert_eq!(parse_syscall("-1"), None);
        assert_eq!(parse_syscall("mount2"), None);
    }
}
