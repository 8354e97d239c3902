//! eBPF syscall blocking program for Heimdall
//!
//! Attaches as a kprobe to the x86_64 syscall dispatcher (`x64_sys_call`),
//! which receives the syscall number as its second argument. For every
//! syscall entry it looks up (syscall_nr, cgroup_id) in FILTER_MAP; on a hit
//! the caller gets SIGKILL, and only if the signal was accepted is an
//! EventRecord staged in the per-CPU scratch slot and pushed to userspace.
//!
//! The program never changes the syscall's return value. A miss costs one
//! hash lookup.

#![no_std]
#![no_main]

use aya_ebpf::{
    cty::c_long,
    helpers::{
        bpf_get_current_cgroup_id, bpf_get_current_comm, bpf_get_current_pid_tgid,
        bpf_get_current_uid_gid, bpf_send_signal,
    },
    macros::{kprobe, map},
    maps::{HashMap, PerCpuArray, PerfEventArray},
    programs::ProbeContext,
};
use aya_log_ebpf::info;
use heimdall_common::{
    EventRecord, FilterKey, FilterRule, MAX_FILTER_ENTRIES, SIGKILL, TASK_COMM_LEN,
};

/// BPF Map: (syscall_nr, cgroup_id) -> rule
/// Written by userspace only; this program never updates it.
#[map]
static FILTER_MAP: HashMap<FilterKey, FilterRule> =
    HashMap::with_max_entries(MAX_FILTER_ENTRIES, 0);

/// Perf buffer carrying confirmed kills to userspace
#[map]
static SYSCALL_EVENTS: PerfEventArray<EventRecord> = PerfEventArray::new(0);

/// One scratch record per CPU. EventRecord is 40 bytes, kept off the
/// 512-byte BPF stack so the layout can grow.
#[map]
static PROCESS_INFO_MAP: PerCpuArray<EventRecord> = PerCpuArray::with_max_entries(1, 0);

/// kprobe/x64_sys_call
#[kprobe]
pub fn sys_call_block(ctx: ProbeContext) -> u32 {
    match try_sys_call_block(&ctx) {
        Ok(ret) => ret,
        Err(_) => 0,
    }
}

fn try_sys_call_block(ctx: &ProbeContext) -> Result<u32, c_long> {
    // x64_sys_call(const struct pt_regs *regs, unsigned int nr)
    let syscall_nr: u32 = ctx.arg(1).ok_or(0)?;
    let cgroup_id = unsafe { bpf_get_current_cgroup_id() };

    let key = FilterKey::new(syscall_nr, cgroup_id);
    if unsafe { FILTER_MAP.get(&key) }.is_none() {
        return Ok(0);
    }

    let ret = unsafe { bpf_send_signal(SIGKILL) };
    if ret != 0 {
        // Signal refused: nothing was enforced, so nothing is reported.
        return Ok(0);
    }

    let pid = (bpf_get_current_pid_tgid() >> 32) as u32;
    let uid = bpf_get_current_uid_gid() as u32;

    info!(
        ctx,
        "Blocking syscall {} for PID {} with UID {} and CgroupID {}",
        syscall_nr,
        pid,
        uid,
        cgroup_id
    );

    let slot = match PROCESS_INFO_MAP.get_ptr_mut(0) {
        Some(ptr) => unsafe { &mut *ptr },
        None => return Ok(0),
    };

    let comm = bpf_get_current_comm().unwrap_or([0u8; TASK_COMM_LEN]);
    slot.fill(pid, uid, syscall_nr, cgroup_id, comm);

    SYSCALL_EVENTS.output(ctx, slot, 0);

    Ok(0)
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}

#[no_mangle]
#[link_section = "license"]
pub static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
