//! Container resource limits read from the Linux cgroup filesystem.
//!
//! This module supplies the cgroup-side resolver for the async lookup
//! engine: given a container id and its cgroup paths, it reads the
//! per-container limit files and produces a [`CgroupLimits`] record.
//! Reads are blocking and therefore always run on the engine's worker
//! thread, never on the event-processing path.
//!
//! # Files read
//!
//! - `memory.limit_in_bytes` (memory subsystem)
//! - `cpu.shares`, `cpu.cfs_quota_us`, `cpu.cfs_period_us` (cpu subsystem)
//! - `cpuset.effective_cpus` (cpuset subsystem, counted as a cpu list)
//!
//! # Key Components
//!
//! - [`CgroupKey`] — container id plus per-subsystem cgroup paths.
//! - [`CgroupLimits`] — the resolved record, one `Option` per field.
//! - [`CgroupLimitsResolver`] — the [`crate::lookup::Resolver`]
//!   implementation over configurable subsystem mounts.
//!
//! # Platform Requirements
//!
//! - Linux with cgroup v1-style named subsystem mounts.
//! - Read access to the subsystem directories (default under
//!   `/sys/fs/cgroup`).
mod cpuset;
mod limits;

pub use cpuset::{CpuListError, count_cpu_list};
pub use limits::{
    CGROUP_VAL_MAX, CgroupKey, CgroupLimits, CgroupLimitsResolver, SubsystemRoots,
};
