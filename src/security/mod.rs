//! Privilege and kernel support checks
//!
//! Attaching the enforcement kprobe and the LSM guard are privileged
//! operations. Before touching the kernel, [`Preflight::run`] reports what
//! is likely to go wrong so the operator sees a clear reason instead of a
//! raw `EPERM`.
//!
//! # Usage
//!
//! ```ignore
//! let report = Preflight::run(policy.needs_guard());
//! report.log();
//! let manager = EnforcementManager::new();
//! ```

pub mod preflight;

pub use preflight::{
    bpf_lsm_active, kallsyms_has, lsm_list_has_bpf, missing_capabilities, LsmStatus, Preflight,
    SymbolStatus,
};
