//! Heimdall - cgroup-scoped syscall blocking with eBPF
//!
//! A kprobe on the kernel's syscall dispatcher looks up every
//! (syscall number, cgroup id) pair in a rule map and SIGKILLs the caller
//! on a hit. Confirmed kills are streamed to userspace as events. An
//! optional LSM guard denies opening chosen files and setuid/setgid
//! escalation inside the same cgroup.
//!
//! # Modules
//!
//! - `enforcement` - Rule store, scratch slots, event channel and the interceptor
//! - `ebpf` - Kernel program loaders and event collector (requires `--features ebpf`)
//! - `config` - YAML / flag configuration and policy resolution
//! - `cgroups` - Container, path and pid to cgroup v2 id resolution
//! - `syscalls` - x86_64 syscall name table
//! - `report` - Event decoding and dry-run output
//! - `security` - Capability and kernel support preflight checks
//! - `metrics` - Prometheus metrics for observability
//! - `telemetry` - Logging and OpenTelemetry setup
//!
//! # Quick Start
//!
//! ```ignore
//! use heimdall::{event_channel, FilterConfig, EnforcementManager, DEFAULT_CAPACITY};
//!
//! let policy = FilterConfig::load("filter.yaml".as_ref())?.resolve()?;
//! let (producer, mut consumer) = event_channel(DEFAULT_CAPACITY);
//!
//! let mut manager = EnforcementManager::try_new()?;
//! manager.apply_policy(&policy).await?;
//! manager.start_collector(&producer).await?;
//! ```

pub mod cgroups;
pub mod config;
pub mod ebpf;
pub mod enforcement;
pub mod metrics;
pub mod report;
pub mod security;
pub mod syscalls;
pub mod telemetry;

// Re-export commonly used types at crate root for convenience
pub use config::{ConfigError, FilterConfig, FilterPolicy, Target};
pub use ebpf::{Denials, EbpfError, EnforcementManager, GuardManager};
pub use enforcement::{
    event_channel, EventConsumer, EventProducer, Interceptor, RuleStore, ScratchBuffer,
    SyscallEntry, Verdict, DEFAULT_CAPACITY,
};
pub use heimdall_common::{EventRecord, FilterKey, FilterRule, PathKey, MAX_FILTER_ENTRIES};
pub use report::{DryRun, EnforcementEvent};
