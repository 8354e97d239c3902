//! Walk through the enforcement engine without loading anything into the kernel.
//!
//! Run with: cargo run --example enforcement_demo
//!
//! Spawns a `sleep` child, pretends it entered `kill(2)` from cgroup 500,
//! and shows the kill and the resulting event.

use std::process::Command;
use std::sync::Arc;

use heimdall::enforcement::{event_channel, Interceptor};
use heimdall::{EnforcementEvent, FilterConfig, RuleStore, SyscallEntry};

const CGROUP: u64 = 500;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_target(false).init();

    let policy = FilterConfig::from_yaml_str(&format!(
        "cgroup_id: {}\nblock_syscalls: [kill, mount]\n",
        CGROUP
    ))?
    .resolve()?;
    println!("{}\n", heimdall::DryRun(&policy));

    let rules = Arc::new(RuleStore::new());
    policy.install(&rules)?;

    let (producer, mut consumer) = event_channel(16);
    // Really kills, one scratch slot per CPU; unit 0 always exists
    let interceptor = Interceptor::new(Arc::clone(&rules), producer);
    println!("scratch units: {}", interceptor.units());

    let mut child = Command::new("sleep").arg("30").spawn()?;
    let pid = child.id();

    let allowed = SyscallEntry::new(62, pid, 0, CGROUP + 1, b"sleep");
    println!("cgroup {} calls kill: {:?}", CGROUP + 1, interceptor.on_syscall_entry(0, &allowed));

    let blocked = SyscallEntry::new(62, pid, 0, CGROUP, b"sleep");
    println!("cgroup {} calls kill: {:?}", CGROUP, interceptor.on_syscall_entry(0, &blocked));
    println!("child exited: {}", child.wait()?);

    for record in consumer.drain() {
        let event = EnforcementEvent::from_record(&record);
        println!("event: {}", event.to_json()?);
    }

    let removed = policy.uninstall(&rules);
    println!("removed {} rules, {} left", removed, rules.len());
    Ok(())
}
