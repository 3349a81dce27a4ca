use dashmap::DashMap;

use crate::cgroup::{CgroupKey, CgroupLimits};

use super::{ContainerID, ContainerMetadata};

/// Store of container records the tracing agent currently tracks.
///
/// The lookup worker never holds a reference into the registry: it only
/// produces values that are applied later by container id, re-checking
/// existence at application time. A container that disappeared while
/// its resolution was in flight simply drops the result.
pub trait ContainerRegistry {
    fn get(&self, id: &ContainerID) -> Option<ContainerMetadata>;
    fn contains(&self, id: &ContainerID) -> bool;
    /// Publishes a provisional record before resolution completes, so
    /// the event path has something to attribute events to. Does not
    /// overwrite an existing record.
    fn insert_stub(&self, metadata: ContainerMetadata);
    /// Writes a (possibly updated) record, replacing any previous one.
    fn apply(&self, metadata: ContainerMetadata);
    fn remove(&self, id: &ContainerID);
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process [`ContainerRegistry`] over a concurrent map.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    containers: DashMap<ContainerID, ContainerMetadata>,
}

impl ContainerRegistry for InMemoryRegistry {
    fn get(&self, id: &ContainerID) -> Option<ContainerMetadata> {
        self.containers.get(id).map(|entry| entry.value().clone())
    }

    fn contains(&self, id: &ContainerID) -> bool {
        self.containers.contains_key(id)
    }

    fn insert_stub(&self, metadata: ContainerMetadata) {
        self.containers
            .entry(metadata.id.clone())
            .or_insert(metadata);
    }

    fn apply(&self, metadata: ContainerMetadata) {
        self.containers.insert(metadata.id.clone(), metadata);
    }

    fn remove(&self, id: &ContainerID) {
        self.containers.remove(id);
    }

    fn len(&self) -> usize {
        self.containers.len()
    }
}

/// Merges resolved cgroup limits into the container's record, or drops
/// them when the container is already gone. Intended as the callback
/// sink for a cgroup-limits lookup engine.
pub fn store_limits<R: ContainerRegistry>(registry: &R, key: &CgroupKey, limits: &CgroupLimits) {
    let Some(mut meta) = registry.get(&key.container_id) else {
        log::debug!(
            "(registry) dropping limits for already gone container [{}]: {limits:?}",
            key.container_id
        );
        return;
    };
    log::debug!(
        "(registry) storing limits for container [{}]: {limits:?}",
        key.container_id
    );
    if let Some(memory_limit) = limits.memory_limit {
        meta.memory_limit = memory_limit;
    }
    if let Some(cpu_shares) = limits.cpu_shares {
        meta.cpu_shares = cpu_shares;
    }
    if let Some(cpu_quota) = limits.cpu_quota {
        meta.cpu_quota = cpu_quota;
    }
    if let Some(cpu_period) = limits.cpu_period {
        meta.cpu_period = cpu_period;
    }
    if limits.cpuset_cpu_count.is_some() {
        meta.cpuset_cpu_count = limits.cpuset_cpu_count;
    }
    registry.apply(meta);
}

/// Replaces the container's record with freshly resolved metadata, or
/// drops it when the container is already gone. Intended as the
/// callback sink for a container-metadata lookup engine.
pub fn store_metadata<R: ContainerRegistry>(registry: &R, metadata: ContainerMetadata) {
    if !registry.contains(&metadata.id) {
        log::debug!(
            "(registry) dropping metadata for already gone container [{}]",
            metadata.id
        );
        return;
    }
    log::debug!("(registry) storing metadata for container [{}]", metadata.id);
    registry.apply(metadata);
}
