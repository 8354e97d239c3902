//! Kernel program loader and rule manager
//!
//! `EnforcementManager` owns the loaded `sys_call_block` object: it
//! attaches the kprobe, edits `FILTER_MAP` and streams `SYSCALL_EVENTS`
//! into an [`EventProducer`].

use std::sync::Arc;

use aya::maps::{AsyncPerfEventArray, HashMap, MapData, MapError};
use aya::programs::KProbe;
use aya::{include_bytes_aligned, Bpf};
use aya_log::BpfLogger;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use heimdall_common::{
    FilterKey, FilterRule, ATTACH_SYMBOL, EVENTS_MAP, FILTER_MAP, PROGRAM_NAME,
};

use super::{collector, is_not_found, EbpfError};
use crate::config::FilterPolicy;
use crate::enforcement::EventProducer;
use crate::metrics;

/// Loads the enforcement kprobe and manages its rules.
pub struct EnforcementManager {
    bpf: Arc<RwLock<Bpf>>,
    readers: Vec<JoinHandle<()>>,
}

fn map_error(e: impl std::fmt::Display) -> EbpfError {
    EbpfError::Map(e.to_string())
}

/// Raise the locked memory limit; kernels before 5.11 charge map memory to it.
fn bump_memlock_rlimit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        tracing::debug!(ret, "failed to remove memlock limit");
    }
}

impl EnforcementManager {
    /// Load and attach the kernel program.
    ///
    /// This requires:
    /// - Kernel exporting `x64_sys_call` (6.9+, x86_64)
    /// - CAP_BPF and CAP_PERFMON capabilities (or root)
    /// - The compiled program in target/ebpf/ (run build-ebpf.sh)
    ///
    /// Returns `None` if the program cannot be loaded (graceful degradation).
    pub fn new() -> Option<Self> {
        match Self::try_new() {
            Ok(manager) => {
                tracing::info!(symbol = ATTACH_SYMBOL, "syscall enforcement attached");
                Some(manager)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to initialize syscall enforcement");
                None
            }
        }
    }

    pub fn try_new() -> Result<Self, EbpfError> {
        bump_memlock_rlimit();

        let mut bpf = Bpf::load(include_bytes_aligned!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/target/ebpf/sys-call-block.o"
        )))
        .map_err(|e| EbpfError::Load(e.to_string()))?;

        // Kernel-side info! lines are forwarded into our tracing output
        if let Err(e) = BpfLogger::init(&mut bpf) {
            tracing::warn!(error = %e, "kernel log forwarding unavailable");
        }

        let program: &mut KProbe = bpf
            .program_mut(PROGRAM_NAME)
            .ok_or_else(|| EbpfError::Load(format!("{} program not found", PROGRAM_NAME)))?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| EbpfError::Load(e.to_string()))?;

        program
            .load()
            .map_err(|e| EbpfError::Load(e.to_string()))?;

        program
            .attach(ATTACH_SYMBOL, 0)
            .map_err(|e| EbpfError::Attach(format!("{}: {}", ATTACH_SYMBOL, e)))?;

        metrics::set_enabled(true);

        Ok(Self {
            bpf: Arc::new(RwLock::new(bpf)),
            readers: Vec::new(),
        })
    }

    pub fn is_enabled(&self) -> bool {
        true
    }

    /// Install one block rule.
    pub async fn insert_rule(&self, key: FilterKey) -> Result<(), EbpfError> {
        let mut bpf = self.bpf.write().await;
        let mut filter: HashMap<_, FilterKey, FilterRule> = bpf
            .map_mut(FILTER_MAP)
            .ok_or_else(|| EbpfError::Map(format!("{} not found", FILTER_MAP)))?
            .try_into()
            .map_err(map_error)?;

        filter
            .insert(key, FilterRule::BLOCK, 0)
            .map_err(|e| {
                EbpfError::Map(format!(
                    "insert syscall {} cgroup {}: {}",
                    key.syscall_nr, key.cgroup_id, e
                ))
            })?;

        tracing::debug!(
            syscall_nr = key.syscall_nr,
            cgroup_id = key.cgroup_id,
            "rule installed"
        );
        Ok(())
    }

    /// Remove one block rule. Returns whether it was present.
    pub async fn remove_rule(&self, key: &FilterKey) -> Result<bool, EbpfError> {
        let mut bpf = self.bpf.write().await;
        let mut filter: HashMap<_, FilterKey, FilterRule> = bpf
            .map_mut(FILTER_MAP)
            .ok_or_else(|| EbpfError::Map(format!("{} not found", FILTER_MAP)))?
            .try_into()
            .map_err(map_error)?;

        match filter.remove(key) {
            Ok(()) => Ok(true),
            Err(MapError::KeyNotFound) => Ok(false),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(EbpfError::Map(format!(
                "remove syscall {} cgroup {}: {}",
                key.syscall_nr, key.cgroup_id, e
            ))),
        }
    }

    /// Install every rule of a policy and refresh the rules gauge.
    pub async fn apply_policy(&self, policy: &FilterPolicy) -> Result<usize, EbpfError> {
        for key in policy.keys() {
            self.insert_rule(key).await?;
        }
        let count = self.rule_count().await?;
        metrics::set_rules_loaded(count);
        tracing::info!(
            cgroup_id = policy.cgroup_id,
            rules = policy.syscalls.len(),
            "policy applied"
        );
        Ok(policy.syscalls.len())
    }

    /// Remove a policy's rules, returning how many were present.
    pub async fn clear_policy(&self, policy: &FilterPolicy) -> Result<usize, EbpfError> {
        let mut removed = 0;
        for key in policy.keys() {
            if self.remove_rule(&key).await? {
                removed += 1;
            }
        }
        let count = self.rule_count().await?;
        metrics::set_rules_loaded(count);
        tracing::info!(cgroup_id = policy.cgroup_id, removed, "policy cleared");
        Ok(removed)
    }

    /// Number of rules currently in the kernel map.
    pub async fn rule_count(&self) -> Result<usize, EbpfError> {
        let bpf = self.bpf.read().await;
        let filter: HashMap<_, FilterKey, FilterRule> = bpf
            .map(FILTER_MAP)
            .ok_or_else(|| EbpfError::Map(format!("{} not found", FILTER_MAP)))?
            .try_into()
            .map_err(map_error)?;

        Ok(filter.keys().filter(Result::is_ok).count())
    }

    /// Start streaming enforcement events into clones of `producer`.
    ///
    /// The caller keeps its own handle, so the consumer stays open even if
    /// every reader exits. The perf map can only be taken once; a second
    /// call fails.
    pub async fn start_collector(&mut self, producer: &EventProducer) -> Result<(), EbpfError> {
        let events = {
            let mut bpf = self.bpf.write().await;
            let map = bpf.take_map(EVENTS_MAP).ok_or_else(|| {
                EbpfError::Map(format!("{} not found or already taken", EVENTS_MAP))
            })?;
            AsyncPerfEventArray::<MapData>::try_from(map).map_err(map_error)?
        };

        self.readers = collector::spawn_readers(events, producer)?;
        tracing::info!(readers = self.readers.len(), "event collector started");
        Ok(())
    }

    /// Stop the event readers.
    pub fn stop_collector(&mut self) {
        for handle in self.readers.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for EnforcementManager {
    fn drop(&mut self) {
        self.stop_collector();
        metrics::set_enabled(false);
    }
}
