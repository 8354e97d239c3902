//! LSM guard loader
//!
//! `GuardManager` owns the `lsm_guard` object. Only the programs a policy
//! needs are loaded: the file guard (kprobe `file_open_mark` plus LSM
//! `file_open_check`) for blocked paths, and the two credential hooks for
//! privilege escalation.

use std::sync::Arc;

use aya::maps::{HashMap, MapError, PerCpuArray};
use aya::programs::{KProbe, Lsm};
use aya::{include_bytes_aligned, Bpf, Btf};
use aya_log::BpfLogger;
use tokio::sync::RwLock;

use heimdall_common::{
    PathKey, ATTACH_SYMBOL, DENIALS_MAP, DENY_FILE_OPEN, DENY_PRIVILEGE, FILE_CHECK_PROGRAM,
    FILE_MARK_PROGRAM, PATH_CGROUPS_MAP, PATH_RULES_MAP, PRIV_CGROUPS_MAP, SETGID_PROGRAM,
    SETUID_PROGRAM,
};

use super::{is_not_found, Denials, EbpfError};
use crate::config::FilterPolicy;
use crate::security::bpf_lsm_active;

const GUARD_ON: u8 = 1;

/// Loads the LSM guard programs and manages their maps.
pub struct GuardManager {
    bpf: Arc<RwLock<Bpf>>,
    files: bool,
    privilege: bool,
}

fn map_error(e: impl std::fmt::Display) -> EbpfError {
    EbpfError::Map(e.to_string())
}

fn load_lsm(bpf: &mut Bpf, name: &str, hook: &str, btf: &Btf) -> Result<(), EbpfError> {
    let program: &mut Lsm = bpf
        .program_mut(name)
        .ok_or_else(|| EbpfError::Load(format!("{} program not found", name)))?
        .try_into()
        .map_err(|e: aya::programs::ProgramError| EbpfError::Load(e.to_string()))?;

    program
        .load(hook, btf)
        .map_err(|e| EbpfError::Load(format!("{}: {}", name, e)))?;

    program
        .attach()
        .map_err(|e| EbpfError::Attach(format!("{}: {}", hook, e)))?;
    Ok(())
}

/// Remove `key`, treating only ENOENT as "was not there".
fn remove_key<K: aya::Pod, V: aya::Pod>(
    map: &mut HashMap<&mut aya::maps::MapData, K, V>,
    key: &K,
    what: &str,
) -> Result<bool, EbpfError> {
    match map.remove(key) {
        Ok(()) => Ok(true),
        Err(MapError::KeyNotFound) => Ok(false),
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(EbpfError::Map(format!("remove {}: {}", what, e))),
    }
}

impl GuardManager {
    /// Load the guards `policy` asks for.
    ///
    /// Returns `None` if they cannot be loaded (graceful degradation).
    pub fn new(policy: &FilterPolicy) -> Option<Self> {
        let files = !policy.file_paths.is_empty();
        match Self::try_new(files, policy.block_privilege_escalation) {
            Ok(manager) => {
                tracing::info!(
                    files,
                    privilege = policy.block_privilege_escalation,
                    "LSM guard attached"
                );
                Some(manager)
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to initialize LSM guard");
                None
            }
        }
    }

    pub fn try_new(files: bool, privilege: bool) -> Result<Self, EbpfError> {
        if !bpf_lsm_active() {
            return Err(EbpfError::NotSupported(
                "BPF not in LSM list (check /sys/kernel/security/lsm)".to_string(),
            ));
        }

        let btf = Btf::from_sys_fs().map_err(|e| EbpfError::Load(e.to_string()))?;

        let mut bpf = Bpf::load(include_bytes_aligned!(concat!(
            env!("CARGO_MANIFEST_DIR"),
            "/target/ebpf/lsm-guard.o"
        )))
        .map_err(|e| EbpfError::Load(e.to_string()))?;

        if let Err(e) = BpfLogger::init(&mut bpf) {
            tracing::warn!(error = %e, "kernel log forwarding unavailable");
        }

        if files {
            // The check hook goes first so a mark never outlives its open
            load_lsm(&mut bpf, FILE_CHECK_PROGRAM, "file_open", &btf)?;

            let program: &mut KProbe = bpf
                .program_mut(FILE_MARK_PROGRAM)
                .ok_or_else(|| {
                    EbpfError::Load(format!("{} program not found", FILE_MARK_PROGRAM))
                })?
                .try_into()
                .map_err(|e: aya::programs::ProgramError| EbpfError::Load(e.to_string()))?;
            program
                .load()
                .map_err(|e| EbpfError::Load(e.to_string()))?;
            program
                .attach(ATTACH_SYMBOL, 0)
                .map_err(|e| EbpfError::Attach(format!("{}: {}", ATTACH_SYMBOL, e)))?;
        }

        if privilege {
            load_lsm(&mut bpf, SETUID_PROGRAM, "task_fix_setuid", &btf)?;
            load_lsm(&mut bpf, SETGID_PROGRAM, "task_fix_setgid", &btf)?;
        }

        Ok(Self {
            bpf: Arc::new(RwLock::new(bpf)),
            files,
            privilege,
        })
    }

    pub fn is_enabled(&self) -> bool {
        true
    }

    /// Install a policy's path rules and privilege guard.
    ///
    /// Returns the number of guard entries written.
    pub async fn apply_policy(&self, policy: &FilterPolicy) -> Result<usize, EbpfError> {
        let keys = policy.path_keys();
        if !keys.is_empty() && !self.files {
            return Err(EbpfError::Load("file guard was not loaded".to_string()));
        }
        if policy.block_privilege_escalation && !self.privilege {
            return Err(EbpfError::Load("privilege guard was not loaded".to_string()));
        }

        let mut bpf = self.bpf.write().await;
        let mut installed = 0;

        if !keys.is_empty() {
            let mut rules: HashMap<_, PathKey, u8> = bpf
                .map_mut(PATH_RULES_MAP)
                .ok_or_else(|| EbpfError::Map(format!("{} not found", PATH_RULES_MAP)))?
                .try_into()
                .map_err(map_error)?;
            for key in &keys {
                rules.insert(key, GUARD_ON, 0).map_err(|e| {
                    EbpfError::Map(format!(
                        "insert path {}: {}",
                        String::from_utf8_lossy(key.path_bytes()),
                        e
                    ))
                })?;
                installed += 1;
            }

            // Enable the cgroup only once its paths are in place
            let mut cgroups: HashMap<_, u64, u8> = bpf
                .map_mut(PATH_CGROUPS_MAP)
                .ok_or_else(|| EbpfError::Map(format!("{} not found", PATH_CGROUPS_MAP)))?
                .try_into()
                .map_err(map_error)?;
            cgroups
                .insert(policy.cgroup_id, GUARD_ON, 0)
                .map_err(map_error)?;
        }

        if policy.block_privilege_escalation {
            let mut cgroups: HashMap<_, u64, u8> = bpf
                .map_mut(PRIV_CGROUPS_MAP)
                .ok_or_else(|| EbpfError::Map(format!("{} not found", PRIV_CGROUPS_MAP)))?
                .try_into()
                .map_err(map_error)?;
            cgroups
                .insert(policy.cgroup_id, GUARD_ON, 0)
                .map_err(map_error)?;
            installed += 1;
        }

        tracing::info!(
            cgroup_id = policy.cgroup_id,
            paths = keys.len(),
            privilege = policy.block_privilege_escalation,
            "guard policy applied"
        );
        Ok(installed)
    }

    /// Remove a policy's guard entries, returning how many were present.
    pub async fn clear_policy(&self, policy: &FilterPolicy) -> Result<usize, EbpfError> {
        let mut bpf = self.bpf.write().await;
        let mut removed = 0;

        if self.files {
            let mut cgroups: HashMap<_, u64, u8> = bpf
                .map_mut(PATH_CGROUPS_MAP)
                .ok_or_else(|| EbpfError::Map(format!("{} not found", PATH_CGROUPS_MAP)))?
                .try_into()
                .map_err(map_error)?;
            remove_key(&mut cgroups, &policy.cgroup_id, "path cgroup")?;

            let mut rules: HashMap<_, PathKey, u8> = bpf
                .map_mut(PATH_RULES_MAP)
                .ok_or_else(|| EbpfError::Map(format!("{} not found", PATH_RULES_MAP)))?
                .try_into()
                .map_err(map_error)?;
            for key in policy.path_keys() {
                if remove_key(&mut rules, &key, "path rule")? {
                    removed += 1;
                }
            }
        }

        if self.privilege {
            let mut cgroups: HashMap<_, u64, u8> = bpf
                .map_mut(PRIV_CGROUPS_MAP)
                .ok_or_else(|| EbpfError::Map(format!("{} not found", PRIV_CGROUPS_MAP)))?
                .try_into()
                .map_err(map_error)?;
            if remove_key(&mut cgroups, &policy.cgroup_id, "privilege cgroup")? {
                removed += 1;
            }
        }

        tracing::info!(cgroup_id = policy.cgroup_id, removed, "guard policy cleared");
        Ok(removed)
    }

    /// Denials so far, summed over CPUs.
    pub async fn denials(&self) -> Result<Denials, EbpfError> {
        let bpf = self.bpf.read().await;
        let counts: PerCpuArray<_, u64> = bpf
            .map(DENIALS_MAP)
            .ok_or_else(|| EbpfError::Map(format!("{} not found", DENIALS_MAP)))?
            .try_into()
            .map_err(map_error)?;

        let total = |kind: u32| -> Result<u64, EbpfError> {
            let values = counts.get(&kind, 0).map_err(map_error)?;
            Ok(values.iter().sum())
        };

        Ok(Denials {
            file_open: total(DENY_FILE_OPEN)?,
            privilege: total(DENY_PRIVILEGE)?,
        })
    }
}
