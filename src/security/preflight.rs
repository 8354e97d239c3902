//! Host checks before loading the kernel program
//!
//! Loading and attaching a kprobe needs either `CAP_SYS_ADMIN` or the
//! split `CAP_BPF` + `CAP_PERFMON` pair (kernel 5.8+), and the attach
//! symbol must exist in the running kernel. The LSM guard additionally
//! needs `bpf` among the active LSMs. Problems are reported as warnings:
//! the loaders make the final call and degrade gracefully.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  CAP_SYS_ADMIN ─────────────────────────┐                   │
//! │                                          ├──► load + attach │
//! │  CAP_BPF ──┬── (both) ───────────────────┘                  │
//! │  CAP_PERFMON ┘                                              │
//! │                                                             │
//! │  /proc/kallsyms ──► "x64_sys_call" present?                 │
//! │  /sys/kernel/security/lsm ──► "bpf" listed? (guard only)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::fmt;
use std::fs;

use caps::{CapSet, Capability};

use heimdall_common::ATTACH_SYMBOL;

const KALLSYMS: &str = "/proc/kallsyms";

/// Comma-separated list of active LSMs
const LSM_LIST: &str = "/sys/kernel/security/lsm";

/// Whether the attach symbol exists in the running kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolStatus {
    Present,
    Missing,
    /// kallsyms could not be read
    Unknown(String),
}

/// Whether the BPF LSM is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LsmStatus {
    /// No file or privilege rules, nothing checked
    NotRequired,
    Active,
    Inactive,
    /// The LSM list could not be read
    Unknown(String),
}

/// Result of the host checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preflight {
    pub missing_caps: Vec<Capability>,
    pub attach_symbol: SymbolStatus,
    pub bpf_lsm: LsmStatus,
}

impl Preflight {
    /// Inspect the current process and kernel. `guard` adds the BPF LSM
    /// check needed for file and privilege rules.
    pub fn run(guard: bool) -> Self {
        let missing_caps = missing_capabilities(|cap| {
            caps::has_cap(None, CapSet::Effective, cap).unwrap_or(false)
        });

        let attach_symbol = match fs::read_to_string(KALLSYMS) {
            Ok(contents) if kallsyms_has(&contents, ATTACH_SYMBOL) => SymbolStatus::Present,
            Ok(_) => SymbolStatus::Missing,
            Err(e) => SymbolStatus::Unknown(e.to_string()),
        };

        let bpf_lsm = if !guard {
            LsmStatus::NotRequired
        } else {
            match fs::read_to_string(LSM_LIST) {
                Ok(contents) if lsm_list_has_bpf(&contents) => LsmStatus::Active,
                Ok(_) => LsmStatus::Inactive,
                Err(e) => LsmStatus::Unknown(e.to_string()),
            }
        };

        Self {
            missing_caps,
            attach_symbol,
            bpf_lsm,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.missing_caps.is_empty()
            && self.attach_symbol == SymbolStatus::Present
            && matches!(self.bpf_lsm, LsmStatus::NotRequired | LsmStatus::Active)
    }

    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !self.missing_caps.is_empty() {
            let names: Vec<String> = self.missing_caps.iter().map(|c| c.to_string()).collect();
            warnings.push(format!(
                "missing capabilities {}: loading the filter will likely fail (run as root)",
                names.join(", ")
            ));
        }
        match &self.attach_symbol {
            SymbolStatus::Present => {}
            SymbolStatus::Missing => warnings.push(format!(
                "kernel has no {} symbol (needs Linux 6.9+ on x86_64)",
                ATTACH_SYMBOL
            )),
            SymbolStatus::Unknown(reason) => warnings.push(format!(
                "could not check for {} in {}: {}",
                ATTACH_SYMBOL, KALLSYMS, reason
            )),
        }
        match &self.bpf_lsm {
            LsmStatus::NotRequired | LsmStatus::Active => {}
            LsmStatus::Inactive => warnings.push(
                "BPF LSM is not active (boot with lsm=...,bpf): file and privilege rules \
                 cannot be enforced"
                    .to_string(),
            ),
            LsmStatus::Unknown(reason) => warnings.push(format!(
                "could not read {}: {}",
                LSM_LIST, reason
            )),
        }
        warnings
    }

    /// Log every warning, or a single debug line when all checks pass.
    pub fn log(&self) {
        if self.is_clean() {
            tracing::debug!("preflight checks passed");
            return;
        }
        for warning in self.warnings() {
            tracing::warn!("{}", warning);
        }
    }
}

impl fmt::Display for Preflight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            return write!(f, "preflight: ok");
        }
        write!(f, "preflight: {}", self.warnings().join("; "))
    }
}

/// Capabilities still needed, given a predicate for the ones held.
///
/// `CAP_SYS_ADMIN` alone is enough; otherwise both `CAP_BPF` and
/// `CAP_PERFMON` are required and whichever is absent is reported.
pub fn missing_capabilities(has: impl Fn(Capability) -> bool) -> Vec<Capability> {
    if has(Capability::CAP_SYS_ADMIN) {
        return Vec::new();
    }
    [Capability::CAP_BPF, Capability::CAP_PERFMON]
        .into_iter()
        .filter(|&cap| !has(cap))
        .collect()
}

/// Whether `/proc/kallsyms` contents list `symbol`.
///
/// Lines look like `ffffffff81001234 T x64_sys_call`, optionally followed
/// by a `[module]` column. Addresses may be zeroed by `kptr_restrict`; only
/// the name matters.
pub fn kallsyms_has(contents: &str, symbol: &str) -> bool {
    contents
        .lines()
        .any(|line| line.split_whitespace().nth(2) == Some(symbol))
}

/// Whether an LSM list such as `lockdown,capability,landlock,bpf` has `bpf`.
pub fn lsm_list_has_bpf(contents: &str) -> bool {
    contents.trim().split(',').any(|lsm| lsm.trim() == "bpf")
}

/// Whether the running kernel has the BPF LSM active.
pub fn bpf_lsm_active() -> bool {
    fs::read_to_string(LSM_LIST)
        .map(|contents| lsm_list_has_bpf(&contents))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sys_admin_is_enough() {
        let missing = missing_capabilities(|cap| cap == Capability::CAP_SYS_ADMIN);
        assert!(missing.is_empty());
    }

    #[test]
    fn test_split_caps() {
        let both = missing_capabilities(|cap| {
            matches!(cap, Capability::CAP_BPF | Capability::CAP_PERFMON)
        });
        assert!(both.is_empty());

        let only_bpf = missing_capabilities(|cap| cap == Capability::CAP_BPF);
        assert_eq!(only_bpf, vec![Capability::CAP_PERFMON]);

        let none = missing_capabilities(|_| false);
        assert_eq!(none, vec![Capability::CAP_BPF, Capability::CAP_PERFMON]);
    }

    #[test]
    fn test_kallsyms_lookup() {
        let contents = "\
ffffffff81000000 T _stext
0000000000000000 T x64_sys_call
ffffffffc0a01000 t x64_sys_call_helper\t[some_mod]
";
        assert!(kallsyms_has(contents, "x64_sys_call"));
        assert!(kallsyms_has(contents, "_stext"));
        assert!(!kallsyms_has(contents, "x64_sys"));
        assert!(!kallsyms_has("", "x64_sys_call"));
    }

    #[test]
    fn test_warnings() {
        let report = Preflight {
            missing_caps: vec![Capability::CAP_BPF],
            attach_symbol: SymbolStatus::Missing,
            bpf_lsm: LsmStatus::Inactive,
        };
        assert!(!report.is_clean());

        let warnings = report.warnings();
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("CAP_BPF"));
        assert!(warnings[1].contains("x64_sys_call"));
        assert!(warnings[2].contains("BPF LSM"));
    }

    #[test]
    fn test_clean_report() {
        let report = Preflight {
            missing_caps: Vec::new(),
            attach_symbol: SymbolStatus::Present,
            bpf_lsm: LsmStatus::NotRequired,
        };
        assert!(report.is_clean());
        assert!(report.warnings().is_empty());
        assert_eq!(report.to_string(), "preflight: ok");
    }

    #[test]
    fn test_lsm_list() {
        assert!(lsm_list_has_bpf("lockdown,capability,landlock,yama,apparmor,bpf\n"));
        assert!(lsm_list_has_bpf("bpf"));
        assert!(!lsm_list_has_bpf("lockdown,capability,yama,apparmor\n"));
        assert!(!lsm_list_has_bpf("lockdown,bpffs"));
        assert!(!lsm_list_has_bpf(""));
    }

    #[test]
    fn test_lsm_checked_only_for_guard() {
        assert_eq!(Preflight::run(false).bpf_lsm, LsmStatus::NotRequired);
        assert_ne!(Preflight::run(true).bpf_lsm, LsmStatus::NotRequired);
    }
}
