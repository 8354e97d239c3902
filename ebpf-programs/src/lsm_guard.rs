//! eBPF LSM guard for file access and privilege escalation
//!
//! Two independent guards, both scoped by cgroup id:
//!
//! - **File access**: a kprobe on `x64_sys_call` reads the path argument of
//!   `open`, `creat`, `openat` and `openat2` straight from the saved user
//!   registers and, on a match in PATH_RULES, marks the task in
//!   PENDING_DENY. The `file_open` LSM hook then denies the marked task's
//!   open with -EACCES. Any other syscall from the task clears the mark.
//! - **Privilege escalation**: the `task_fix_setuid` / `task_fix_setgid`
//!   hooks deny credential changes with -EPERM for non-root callers in a
//!   guarded cgroup (e.g. a setuid binary calling `setuid(0)`).
//!
//! ```text
//! open("/etc/shadow") ──► kprobe: PATH_RULES hit ──► PENDING_DENY[task]
//!                                                          │
//!          file_open LSM hook ◄────────────────────────────┘
//!                 │
//!                 └──► -EACCES, DENIAL_COUNTS[0]++
//! ```

#![no_std]
#![no_main]

use aya_ebpf::{
    cty::c_long,
    helpers::{
        bpf_get_current_cgroup_id, bpf_get_current_pid_tgid, bpf_get_current_uid_gid,
        bpf_probe_read_kernel, bpf_probe_read_user_str_bytes,
    },
    macros::{kprobe, lsm, map},
    maps::{HashMap, PerCpuArray},
    programs::{LsmContext, ProbeContext},
};
use aya_log_ebpf::info;
use heimdall_common::{
    open_path_arg, PathArg, PathKey, DENIAL_KINDS, DENY_FILE_OPEN, DENY_PRIVILEGE, EACCES, EPERM,
    MAX_GUARDED_CGROUPS, MAX_PATH_BYTES, MAX_PATH_RULES, MAX_PENDING_DENIALS,
};

/// Offsets of the first two syscall arguments in x86_64 `struct pt_regs`
const RDI_OFFSET: usize = 112;
const RSI_OFFSET: usize = 104;

/// BPF Map: (cgroup_id, path) -> 1
#[map]
static PATH_RULES: HashMap<PathKey, u8> = HashMap::with_max_entries(MAX_PATH_RULES, 0);

/// BPF Map: cgroup_id -> 1 for cgroups with path rules.
/// Lets every other cgroup skip the string read.
#[map]
static PATH_CGROUPS: HashMap<u64, u8> = HashMap::with_max_entries(MAX_GUARDED_CGROUPS, 0);

/// BPF Map: pid_tgid -> 1, the task's current open must be denied
#[map]
static PENDING_DENY: HashMap<u64, u8> = HashMap::with_max_entries(MAX_PENDING_DENIALS, 0);

/// BPF Map: cgroup_id -> 1 for cgroups under the privilege guard
#[map]
static PRIV_CGROUPS: HashMap<u64, u8> = HashMap::with_max_entries(MAX_GUARDED_CGROUPS, 0);

/// BPF Map: denials per kind, per CPU (summed by userspace)
#[map]
static DENIAL_COUNTS: PerCpuArray<u64> = PerCpuArray::with_max_entries(DENIAL_KINDS, 0);

/// kprobe/x64_sys_call
#[kprobe]
pub fn file_open_mark(ctx: ProbeContext) -> u32 {
    match try_file_open_mark(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_file_open_mark(ctx: &ProbeContext) -> Result<u32, c_long> {
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    if unsafe { PATH_CGROUPS.get(&cgroup_id) }.is_none() {
        return Ok(0);
    }

    let pid_tgid = bpf_get_current_pid_tgid();

    // x64_sys_call(const struct pt_regs *regs, unsigned int nr)
    let syscall_nr: u32 = ctx.arg(1).ok_or(0)?;
    let Some(arg) = open_path_arg(syscall_nr) else {
        let _ = PENDING_DENY.remove(&pid_tgid);
        return Ok(0);
    };

    let offset = match arg {
        PathArg::First => RDI_OFFSET,
        PathArg::Second => RSI_OFFSET,
    };
    let regs: *const u8 = ctx.arg(0).ok_or(0)?;
    let user_path: u64 = unsafe { bpf_probe_read_kernel(regs.add(offset) as *const u64)? };

    let mut key = PathKey::zeroed(cgroup_id);
    let read = unsafe { bpf_probe_read_user_str_bytes(user_path as *const u8, &mut key.path) };
    // A full buffer may be a truncated longer path
    let fits = matches!(read, Ok(path) if path.len() <= MAX_PATH_BYTES);
    if !fits {
        let _ = PENDING_DENY.remove(&pid_tgid);
        return Ok(0);
    }

    if unsafe { PATH_RULES.get(&key) }.is_some() {
        PENDING_DENY.insert(&pid_tgid, &1, 0)?;
    } else {
        let _ = PENDING_DENY.remove(&pid_tgid);
    }

    Ok(0)
}

/// LSM hook for file_open
/// Returns 0 to allow, negative errno to deny
#[lsm(hook = "file_open")]
pub fn file_open_check(ctx: LsmContext) -> i32 {
    // file_open(struct file *file), previous hook's verdict follows
    let prev: i32 = unsafe { ctx.arg(1) };
    if prev != 0 {
        return prev;
    }

    let pid_tgid = bpf_get_current_pid_tgid();
    if unsafe { PENDING_DENY.get(&pid_tgid) }.is_none() {
        return 0;
    }
    let _ = PENDING_DENY.remove(&pid_tgid);

    count_denial(DENY_FILE_OPEN);
    info!(&ctx, "Denied file open for PID {}", (pid_tgid >> 32) as u32);
    -EACCES
}

/// LSM hook for task_fix_setuid
#[lsm(hook = "task_fix_setuid")]
pub fn task_fix_setuid_check(ctx: LsmContext) -> i32 {
    // task_fix_setuid(struct cred *new, const struct cred *old, int flags)
    let prev: i32 = unsafe { ctx.arg(3) };
    check_credential_change(&ctx, prev)
}

/// LSM hook for task_fix_setgid
#[lsm(hook = "task_fix_setgid")]
pub fn task_fix_setgid_check(ctx: LsmContext) -> i32 {
    let prev: i32 = unsafe { ctx.arg(3) };
    check_credential_change(&ctx, prev)
}

fn check_credential_change(ctx: &LsmContext, prev: i32) -> i32 {
    if prev != 0 {
        return prev;
    }

    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };
    if unsafe { PRIV_CGROUPS.get(&cgroup_id) }.is_none() {
        return 0;
    }

    // Real uid 0 may still drop privileges
    let uid = bpf_get_current_uid_gid() as u32;
    if uid == 0 {
        return 0;
    }

    count_denial(DENY_PRIVILEGE);
    info!(
        ctx,
        "Denied credential change for PID {} with UID {} and CgroupID {}",
        (bpf_get_current_pid_tgid() >> 32) as u32,
        uid,
        cgroup_id
    );
    -EPERM
}

#[inline(always)]
fn count_denial(kind: u32) {
    if let Some(counter) = DENIAL_COUNTS.get_ptr_mut(kind) {
        unsafe { *counter += 1 };
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[no_mangle]
#[link_section = "license"]
pub static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
