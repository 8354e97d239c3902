//! Syscall entry interceptor and enforcement action
//!
//! [`Interceptor::on_syscall_entry`] is the userspace counterpart of the
//! `sys_call_block` kprobe: one rule lookup per syscall, a kill on match,
//! and an event only once the kill was accepted.
//!
//! ```text
//! SyscallEntry ──► RuleStore.lookup ──miss──► Allowed
//!                        │
//!                       hit
//!                        ▼
//!               TerminationSignal ──err──► SignalFailed
//!                        │
//!                       ok
//!                        ▼
//!             ScratchBuffer[unit] ──busy──► Terminated(SlotUnavailable)
//!                        │
//!                        ▼
//!               EventProducer.publish ──► Terminated(Published | Saturated | Detached)
//! ```
//!
//! Every branch returns; nothing on this path allocates, blocks, or retries.

use std::sync::Arc;

use heimdall_common::{comm_from_bytes, FilterKey, TASK_COMM_LEN};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;

use super::channel::{EventProducer, Publish};
use super::scratch::ScratchBuffer;
use super::store::RuleStore;

/// Context observed at syscall entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyscallEntry {
    pub syscall_nr: u32,
    pub pid: u32,
    pub uid: u32,
    pub cgroup_id: u64,
    pub comm: [u8; TASK_COMM_LEN],
}

impl SyscallEntry {
    /// Build an entry, truncating `comm` to the fixed field width.
    pub fn new(syscall_nr: u32, pid: u32, uid: u32, cgroup_id: u64, comm: &[u8]) -> Self {
        Self {
            syscall_nr,
            pid,
            uid,
            cgroup_id,
            comm: comm_from_bytes(comm),
        }
    }

    pub fn key(&self) -> FilterKey {
        FilterKey::new(self.syscall_nr, self.cgroup_id)
    }
}

/// Termination signal was not delivered.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("failed to signal pid {pid}: {reason}")]
pub struct SignalError {
    pub pid: u32,
    pub reason: &'static str,
}

/// Sends the kill-equivalent signal to a process.
pub trait TerminationSignal {
    /// Ask for `pid` to be terminated. `Ok` means delivery was accepted.
    fn terminate(&self, pid: u32) -> Result<(), SignalError>;
}

/// Kills processes with SIGKILL.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessKiller;

impl TerminationSignal for ProcessKiller {
    fn terminate(&self, pid: u32) -> Result<(), SignalError> {
        // 0 and negative pids address process groups, never a single caller
        let raw = match i32::try_from(pid) {
            Ok(raw) if raw > 0 => raw,
            _ => {
                return Err(SignalError {
                    pid,
                    reason: "not a single-process pid",
                })
            }
        };
        kill(Pid::from_raw(raw), Signal::SIGKILL).map_err(|errno| SignalError {
            pid,
            reason: errno.desc(),
        })
    }
}

/// Fate of the event for a terminated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Record queued for the consumer
    Published,
    /// No scratch slot for this unit; telemetry lost
    SlotUnavailable,
    /// Channel full; record dropped
    Saturated,
    /// No consumer; record dropped
    Detached,
}

impl From<Publish> for Delivery {
    fn from(publish: Publish) -> Self {
        match publish {
            Publish::Sent => Delivery::Published,
            Publish::Saturated => Delivery::Saturated,
            Publish::Detached => Delivery::Detached,
        }
    }
}

/// Outcome of one intercepted syscall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No rule for (syscall, cgroup); the syscall proceeds
    Allowed,
    /// A rule matched but the signal was refused; nothing reported
    SignalFailed,
    /// The process was killed
    Terminated(Delivery),
}

impl Verdict {
    /// Whether a rule matched and a kill was attempted.
    pub fn matched(&self) -> bool {
        !matches!(self, Verdict::Allowed)
    }
}

/// Per-syscall policy check bound to a rule store, a signal sender, the
/// scratch slots and the event channel.
pub struct Interceptor<S = ProcessKiller> {
    rules: Arc<RuleStore>,
    signal: S,
    scratch: ScratchBuffer,
    events: EventProducer,
}

impl Interceptor<ProcessKiller> {
    /// Interceptor that really kills, with one scratch slot per CPU.
    pub fn new(rules: Arc<RuleStore>, events: EventProducer) -> Self {
        Self::with_signal(rules, ProcessKiller, ScratchBuffer::per_cpu(), events)
    }
}

impl<S: TerminationSignal> Interceptor<S> {
    pub fn with_signal(
        rules: Arc<RuleStore>,
        signal: S,
        scratch: ScratchBuffer,
        events: EventProducer,
    ) -> Self {
        Self {
            rules,
            signal,
            scratch,
            events,
        }
    }

    /// Number of execution units this interceptor has slots for.
    pub fn units(&self) -> usize {
        self.scratch.units()
    }

    pub fn rules(&self) -> &Arc<RuleStore> {
        &self.rules
    }

    pub fn signal(&self) -> &S {
        &self.signal
    }

    /// Check one syscall entry observed on execution unit `unit`.
    ///
    /// Must not be invoked twice concurrently for the same unit; if it is,
    /// the second invocation still enforces but reports `SlotUnavailable`.
    pub fn on_syscall_entry(&self, unit: usize, entry: &SyscallEntry) -> Verdict {
        if self.rules.lookup(&entry.key()).is_none() {
            return Verdict::Allowed;
        }

        if let Err(e) = self.signal.terminate(entry.pid) {
            tracing::debug!(error = %e, syscall_nr = entry.syscall_nr, "termination not delivered");
            return Verdict::SignalFailed;
        }

        let delivery = self.scratch.with_slot(unit, |slot| {
            slot.fill(
                entry.pid,
                entry.uid,
                entry.syscall_nr,
                entry.cgroup_id,
                entry.comm,
            );
            Delivery::from(self.events.publish(slot))
        });

        Verdict::Terminated(delivery.unwrap_or(Delivery::SlotUnavailable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::channel::event_channel;
    use heimdall_common::FilterRule;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records kill attempts and accepts or refuses all of them.
    #[derive(Default)]
    struct FakeSignal {
        refuse: bool,
        attempts: AtomicUsize,
    }

    impl TerminationSignal for FakeSignal {
        fn terminate(&self, pid: u32) -> Result<(), SignalError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                Err(SignalError {
                    pid,
                    reason: "refused",
                })
            } else {
                Ok(())
            }
        }
    }

    fn store_with(keys: &[FilterKey]) -> Arc<RuleStore> {
        let store = RuleStore::new();
        for key in keys {
            store.insert(*key, FilterRule::BLOCK).unwrap();
        }
        Arc::new(store)
    }

    #[test]
    fn test_miss_allows_without_signal() {
        let (producer, mut consumer) = event_channel(8);
        let interceptor = Interceptor::with_signal(
            store_with(&[FilterKey::new(62, 500)]),
            FakeSignal::default(),
            ScratchBuffer::new(1),
            producer,
        );

        let verdict = interceptor.on_syscall_entry(0, &SyscallEntry::new(62, 10, 0, 501, b"sh"));

        assert_eq!(verdict, Verdict::Allowed);
        assert!(!verdict.matched());
        assert_eq!(interceptor.signal.attempts.load(Ordering::SeqCst), 0);
        assert!(consumer.try_recv().is_none());
    }

    #[test]
    fn test_match_kills_and_reports() {
        let (producer, mut consumer) = event_channel(8);
        let interceptor = Interceptor::with_signal(
            store_with(&[FilterKey::new(62, 500)]),
            FakeSignal::default(),
            ScratchBuffer::new(1),
            producer,
        );

        let entry = SyscallEntry::new(62, 4242, 1000, 500, b"malicious-binary-name");
        let verdict = interceptor.on_syscall_entry(0, &entry);

        assert_eq!(verdict, Verdict::Terminated(Delivery::Published));
        let record = consumer.try_recv().unwrap();
        assert_eq!(record.pid, 4242);
        assert_eq!(record.uid, 1000);
        assert_eq!(record.syscall_nr, 62);
        assert_eq!(record.cgroup_id, 500);
        assert_eq!(record.comm_bytes(), b"malicious-binar");
    }

    #[test]
    fn test_refused_signal_emits_nothing() {
        let (producer, mut consumer) = event_channel(8);
        let interceptor = Interceptor::with_signal(
            store_with(&[FilterKey::new(62, 500)]),
            FakeSignal {
                refuse: true,
                ..Default::default()
            },
            ScratchBuffer::new(1),
            producer,
        );

        let verdict = interceptor.on_syscall_entry(0, &SyscallEntry::new(62, 1, 0, 500, b"sh"));

        assert_eq!(verdict, Verdict::SignalFailed);
        assert!(verdict.matched());
        assert!(consumer.try_recv().is_none());
        assert_eq!(consumer.dropped(), 0);
    }

    #[test]
    fn test_missing_slot_still_enforces() {
        let (producer, mut consumer) = event_channel(8);
        let interceptor = Interceptor::with_signal(
            store_with(&[FilterKey::new(62, 500)]),
            FakeSignal::default(),
            ScratchBuffer::new(1),
            producer,
        );

        let verdict = interceptor.on_syscall_entry(3, &SyscallEntry::new(62, 1, 0, 500, b"sh"));

        assert_eq!(verdict, Verdict::Terminated(Delivery::SlotUnavailable));
        assert_eq!(interceptor.signal.attempts.load(Ordering::SeqCst), 1);
        assert!(consumer.try_recv().is_none());
    }

    #[test]
    fn test_saturated_channel_reports_drop() {
        let (producer, mut consumer) = event_channel(1);
        let interceptor = Interceptor::with_signal(
            store_with(&[FilterKey::new(62, 500)]),
            FakeSignal::default(),
            ScratchBuffer::new(1),
            producer,
        );
        let entry = SyscallEntry::new(62, 1, 0, 500, b"sh");

        assert_eq!(
            interceptor.on_syscall_entry(0, &entry),
            Verdict::Terminated(Delivery::Published)
        );
        assert_eq!(
            interceptor.on_syscall_entry(0, &entry),
            Verdict::Terminated(Delivery::Saturated)
        );
        assert_eq!(consumer.drain().len(), 1);
        assert_eq!(consumer.dropped(), 1);
    }

    #[test]
    fn test_process_killer_refuses_group_pids() {
        assert!(ProcessKiller.terminate(0).is_err());
        assert!(ProcessKiller.terminate(u32::MAX).is_err());
    }

    #[test]
    fn test_signal_error_borrows_static_text() {
        fn plain_data<T: Copy + 'static>(_: &T) {}

        let err = ProcessKiller.terminate(0).unwrap_err();
        plain_data(&err);
        assert_eq!(err.reason, "not a single-process pid");
        assert_eq!(err.to_string(), "failed to signal pid 0: not a single-process pid");
    }

    #[test]
    fn test_signal_error_carries_errno_text() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        // Reaped; the pid names no process until it is reused
        let err = ProcessKiller.terminate(pid).unwrap_err();
        assert_eq!(err.pid, pid);
        assert_eq!(err.reason, nix::errno::Errno::ESRCH.desc());
    }
}
