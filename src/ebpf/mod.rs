//! Kernel-side enforcement via eBPF
//!
//! The `sys_call_block` kprobe sits on `x64_sys_call`, the x86_64 syscall
//! dispatcher, and kills any caller whose (syscall, cgroup) pair is in
//! `FILTER_MAP`. This module loads it and feeds its events to userspace.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Kernel Space (sys_call_block kprobe on x64_sys_call)       │
//! │                                                             │
//! │  (nr, cgroup) ──lookup──► FILTER_MAP                        │
//! │                    │ hit                                    │
//! │                    ▼                                        │
//! │             bpf_send_signal(SIGKILL)                        │
//! │                    │ ok                                     │
//! │                    ▼                                        │
//! │  PROCESS_INFO_MAP[cpu] ──► SYSCALL_EVENTS (perf)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  User Space (EnforcementManager)                            │
//! │                                                             │
//! │  apply_policy(policy)   → insert into FILTER_MAP            │
//! │  start_collector(tx)    → per-CPU perf readers → channel    │
//! │  clear_policy(policy)   → remove from FILTER_MAP            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! let (producer, mut consumer) = event_channel(DEFAULT_CAPACITY);
//!
//! if let Some(mut manager) = EnforcementManager::new() {
//!     manager.apply_policy(&policy).await?;
//!     manager.start_collector(&producer).await?;
//!
//!     while let Some(record) = consumer.recv().await {
//!         EnforcementEvent::from_record(&record).log();
//!     }
//! }
//! ```
//!
//! ## LSM guard
//!
//! File path and privilege escalation blocking live in a second object,
//! `lsm_guard`, managed by [`GuardManager`]. Paths are compared with the
//! literal string passed to `open`/`openat`, so relative paths, symlinks
//! and `..` components are not resolved, and a task that rewrites the
//! string between the check and the open is not caught.
//!
//! ## Requirements
//!
//! - Linux 6.9+ on x86_64 (exports `x64_sys_call`)
//! - CAP_BPF and CAP_PERFMON capabilities (or root)
//! - `bpf` in `/sys/kernel/security/lsm` for the LSM guard
//! - Pre-built eBPF programs in target/ebpf/ (run build-ebpf.sh)
//! - Compiled with `--features ebpf`

use std::error::Error as StdError;

use thiserror::Error;

pub mod collector;
#[cfg(feature = "ebpf")]
mod guard;
#[cfg(feature = "ebpf")]
mod loader;

pub use collector::decode_record;
#[cfg(feature = "ebpf")]
pub use guard::GuardManager;
#[cfg(feature = "ebpf")]
pub use loader::EnforcementManager;

/// Error type for eBPF operations
#[derive(Debug, Error)]
pub enum EbpfError {
    #[error("eBPF load error: {0}")]
    Load(String),

    #[error("eBPF attach error: {0}")]
    Attach(String),

    #[error("eBPF map error: {0}")]
    Map(String),

    #[error("eBPF LSM not supported: {0}")]
    NotSupported(String),

    #[error("eBPF support not compiled in (build with --features ebpf)")]
    NotEnabled,
}

/// LSM guard denials, summed over CPUs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Denials {
    pub file_open: u64,
    pub privilege: u64,
}

impl Denials {
    pub fn total(&self) -> u64 {
        self.file_open + self.privilege
    }
}

/// Whether `err`, or any error in its source chain, is an OS `ENOENT`.
///
/// Map deletes report a missing key this way; every other errno is a real
/// failure.
#[cfg_attr(not(feature = "ebpf"), allow(dead_code))]
pub(crate) fn is_not_found(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.raw_os_error() == Some(libc::ENOENT) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

/// Stub EnforcementManager for when the eBPF feature is disabled.
///
/// Same surface as the real manager so callers need no feature flags.
#[cfg(not(feature = "ebpf"))]
pub struct EnforcementManager;

#[cfg(not(feature = "ebpf"))]
impl EnforcementManager {
    /// Returns None when the eBPF feature is disabled.
    pub fn new() -> Option<Self> {
        tracing::warn!("eBPF feature not enabled at compile time");
        None
    }

    pub fn try_new() -> Result<Self, EbpfError> {
        Err(EbpfError::NotEnabled)
    }

    pub fn is_enabled(&self) -> bool {
        false
    }

    pub async fn insert_rule(&self, _key: heimdall_common::FilterKey) -> Result<(), EbpfError> {
        Err(EbpfError::NotEnabled)
    }

    pub async fn remove_rule(&self, _key: &heimdall_common::FilterKey) -> Result<bool, EbpfError> {
        Err(EbpfError::NotEnabled)
    }

    pub async fn apply_policy(
        &self,
        _policy: &crate::config::FilterPolicy,
    ) -> Result<usize, EbpfError> {
        Err(EbpfError::NotEnabled)
    }

    pub async fn clear_policy(
        &self,
        _policy: &crate::config::FilterPolicy,
    ) -> Result<usize, EbpfError> {
        Err(EbpfError::NotEnabled)
    }

    pub async fn rule_count(&self) -> Result<usize, EbpfError> {
        Ok(0)
    }

    pub async fn start_collector(
        &mut self,
        _producer: &crate::enforcement::EventProducer,
    ) -> Result<(), EbpfError> {
        Err(EbpfError::NotEnabled)
    }

    pub fn stop_collector(&mut self) {}
}

/// Stub GuardManager for when the eBPF feature is disabled.
#[cfg(not(feature = "ebpf"))]
pub struct GuardManager;

#[cfg(not(feature = "ebpf"))]
impl GuardManager {
    pub fn new(_policy: &crate::config::FilterPolicy) -> Option<Self> {
        tracing::warn!("eBPF feature not enabled at compile time");
        None
    }

    pub fn try_new(_files: bool, _privilege: bool) -> Result<Self, EbpfError> {
        Err(EbpfError::NotEnabled)
    }

    pub fn is_enabled(&self) -> bool {
        false
    }

    pub async fn apply_policy(
        &self,
        _policy: &crate::config::FilterPolicy,
    ) -> Result<usize, EbpfError> {
        Err(EbpfError::NotEnabled)
    }

    pub async fn clear_policy(
        &self,
        _policy: &crate::config::FilterPolicy,
    ) -> Result<usize, EbpfError> {
        Err(EbpfError::NotEnabled)
    }

    pub async fn denials(&self) -> Result<Denials, EbpfError> {
        Ok(Denials::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[derive(Debug, Error)]
    #[error("`bpf_map_delete_elem` failed")]
    struct DeleteFailed {
        #[source]
        io_error: io::Error,
    }

    #[derive(Debug, Error)]
    enum WrappedMapError {
        #[error(transparent)]
        Syscall(#[from] DeleteFailed),
    }

    fn delete_failed(errno: i32) -> WrappedMapError {
        DeleteFailed {
            io_error: io::Error::from_raw_os_error(errno),
        }
        .into()
    }

    #[test]
    fn test_enoent_is_not_found() {
        assert!(is_not_found(&delete_failed(libc::ENOENT)));
        assert!(is_not_found(&io::Error::from_raw_os_error(libc::ENOENT)));
    }

    #[test]
    fn test_other_errno_is_a_failure() {
        assert!(!is_not_found(&delete_failed(libc::EPERM)));
        assert!(!is_not_found(&delete_failed(libc::EBADF)));
        assert!(!is_not_found(&io::Error::new(io::ErrorKind::NotFound, "no errno")));
    }

    #[test]
    fn test_denials_total() {
        let denials = Denials {
            file_open: 3,
            privilege: 2,
        };
        assert_eq!(denials.total(), 5);
    }

    #[cfg(not(feature = "ebpf"))]
    #[test]
    fn test_stub_degrades() {
        assert!(EnforcementManager::new().is_none());
        assert!(matches!(
            EnforcementManager::try_new(),
            Err(EbpfError::NotEnabled)
        ));

        let policy = crate::config::FilterPolicy {
            block_privilege_escalation: true,
            ..crate::config::FilterPolicy::syscalls(1, vec![])
        };
        assert!(GuardManager::new(&policy).is_none());
        assert!(matches!(
            GuardManager::try_new(false, true),
            Err(EbpfError::NotEnabled)
        ));
    }
}
