use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::container::ContainerID;
use crate::lookup::Resolver;

use super::cpuset::count_cpu_list;

/// Upper bound for plausible cgroup limit values, about 4 TiB.
///
/// Kubernetes and friends write an almost-but-not-quite 9 EiB sentinel
/// into limit files to mean "unlimited"; anything above this bound is
/// reported as no limit at all. Cpu shares/quota values are far smaller
/// in practice, so the same bound applies to them.
pub const CGROUP_VAL_MAX: i64 = (1 << 42) - 1;

/// Identifies one container's cgroup directories across the subsystems
/// the limits are read from. The cgroup fields are paths relative to
/// each subsystem mount, as reported by `/proc/<pid>/cgroup`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CgroupKey {
    pub container_id: ContainerID,
    pub mem_cgroup: String,
    pub cpu_cgroup: String,
    pub cpuset_cgroup: String,
}

impl fmt::Display for CgroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.container_id, f)
    }
}

/// Resource limits resolved from cgroupfs for one container.
///
/// Each field is `None` when its file was unreadable or its value
/// implausible; `complete` is true only when every field that had a
/// per-container cgroup was obtained. Partial data is preferred over
/// discarding the record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CgroupLimits {
    pub memory_limit: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<i64>,
    pub cpuset_cpu_count: Option<u32>,
    pub complete: bool,
}

/// Mount directories of the cgroup subsystems the limits live in.
#[derive(Debug, Clone)]
pub struct SubsystemRoots {
    pub memory: PathBuf,
    pub cpu: PathBuf,
    pub cpuset: PathBuf,
}

impl SubsystemRoots {
    pub fn new(
        memory: impl Into<PathBuf>,
        cpu: impl Into<PathBuf>,
        cpuset: impl Into<PathBuf>,
    ) -> Self {
        Self {
            memory: memory.into(),
            cpu: cpu.into(),
            cpuset: cpuset.into(),
        }
    }
}

impl Default for SubsystemRoots {
    fn default() -> Self {
        Self::new(
            "/sys/fs/cgroup/memory",
            "/sys/fs/cgroup/cpu",
            "/sys/fs/cgroup/cpuset",
        )
    }
}

/// Resolves [`CgroupLimits`] for a [`CgroupKey`] by reading limit files
/// under the configured subsystem mounts. Runs on the lookup engine's
/// worker thread; every read is allowed to block.
#[derive(Debug, Clone, Default)]
pub struct CgroupLimitsResolver {
    roots: SubsystemRoots,
}

impl CgroupLimitsResolver {
    pub fn new(roots: SubsystemRoots) -> Self {
        Self { roots }
    }
}

impl Resolver for CgroupLimitsResolver {
    type Key = CgroupKey;
    type Value = CgroupLimits;

    fn resolve(&mut self, key: &CgroupKey) -> CgroupLimits {
        let mut limits = CgroupLimits::default();
        let mut complete = true;

        // A cgroup path that does not mention the container id is the
        // parent's cgroup, not a per-container one; those fields were
        // never there to collect and do not count against `complete`.
        if !key.mem_cgroup.contains(key.container_id.as_ref()) {
            log::debug!(
                "(cgroup-limits) no per-container memory cgroup for [{}]: {}, skipping",
                key.container_id,
                key.mem_cgroup
            );
        } else {
            limits.memory_limit =
                read_cgroup_val(&self.roots.memory, &key.mem_cgroup, "memory.limit_in_bytes");
            complete &= limits.memory_limit.is_some();
        }

        if !key.cpu_cgroup.contains(key.container_id.as_ref()) {
            log::debug!(
                "(cgroup-limits) no per-container cpu cgroup for [{}]: {}, skipping",
                key.container_id,
                key.cpu_cgroup
            );
        } else {
            limits.cpu_shares = read_cgroup_val(&self.roots.cpu, &key.cpu_cgroup, "cpu.shares");
            limits.cpu_quota =
                read_cgroup_val(&self.roots.cpu, &key.cpu_cgroup, "cpu.cfs_quota_us");
            limits.cpu_period =
                read_cgroup_val(&self.roots.cpu, &key.cpu_cgroup, "cpu.cfs_period_us");
            complete &= limits.cpu_shares.is_some()
                && limits.cpu_quota.is_some()
                && limits.cpu_period.is_some();
        }

        if !key.cpuset_cgroup.contains(key.container_id.as_ref()) {
            log::debug!(
                "(cgroup-limits) no per-container cpuset cgroup for [{}]: {}, skipping",
                key.container_id,
                key.cpuset_cgroup
            );
        } else {
            limits.cpuset_cpu_count = read_cpuset_count(
                &self.roots.cpuset,
                &key.cpuset_cgroup,
                "cpuset.effective_cpus",
            );
            complete &= limits.cpuset_cpu_count.is_some();
        }

        limits.complete = complete;
        log::debug!(
            "(cgroup-limits) got limits for [{}]: {:?}",
            key.container_id,
            limits
        );
        limits
    }
}

fn cgroup_file(subsys: &Path, cgroup: &str, filename: &str) -> PathBuf {
    subsys.join(cgroup.trim_start_matches('/')).join(filename)
}

/// Reads a single integer value from a cgroup file, rejecting values
/// outside (0, [`CGROUP_VAL_MAX`]] as implausible.
fn read_cgroup_val(subsys: &Path, cgroup: &str, filename: &str) -> Option<i64> {
    let path = cgroup_file(subsys, cgroup, filename);
    let val = std::fs::read_to_string(&path)
        .ok()
        .and_then(|text| text.split_whitespace().next()?.parse::<i64>().ok())
        .unwrap_or(-1);
    if !(1..=CGROUP_VAL_MAX).contains(&val) {
        log::debug!(
            "(cgroup-limits) value of `{}` ({val}) out of range, ignoring",
            path.display()
        );
        return None;
    }
    Some(val)
}

fn read_cpuset_count(subsys: &Path, cgroup: &str, filename: &str) -> Option<u32> {
    let path = cgroup_file(subsys, cgroup, filename);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) => {
            log::debug!("(cgroup-limits) failed to read `{}`: {err}", path.display());
            return None;
        }
    };
    match count_cpu_list(&text) {
        Ok(count) => {
            log::debug!(
                "(cgroup-limits) cpu set from `{}`: {} = {count}",
                path.display(),
                text.trim()
            );
            Some(count)
        }
        Err(err) => {
            log::debug!(
                "(cgroup-limits) invalid cpu list in `{}`: {err}",
                path.display()
            );
            None
        }
    }
}
