//! Container metadata resolution against a container-runtime socket.
//!
//! The resolver fetches a container's inspection document through the
//! narrow [`RuntimeClient`] seam, extracts the fields the tracing agent
//! cares about (image identity, resource limits, health probes, network
//! and mount layout) into a [`ContainerMetadata`] record, and flags the
//! record as failed when the runtime could not be queried. It runs
//! exclusively on the lookup engine's worker thread, so every fetch may
//! block.
//!
//! Transport is out of scope here: how `RuntimeClient` reaches the
//! daemon (unix socket, TCP, a recorded fixture in tests) is its
//! implementor's business.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cgroup::count_cpu_list;
use crate::error::ResultOkLogExt;
use crate::lookup::Resolver;

use super::ContainerID;

/// Label under which Kubernetes stores the stringified pod spec on a
/// container.
const K8S_POD_SPEC_LABEL: &str = "annotation.kubectl.kubernetes.io/last-applied-configuration";

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request to container runtime failed for `{endpoint}`: {reason}")]
    Request { endpoint: String, reason: String },
    #[error("container runtime response for `{endpoint}` is not valid json: {source}")]
    InvalidJson {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Narrow transport seam to the container runtime.
///
/// Implementations perform the actual (blocking) communication with the
/// runtime daemon and hand back the parsed inspection documents.
pub trait RuntimeClient: Send + 'static {
    fn inspect_container(&mut self, id: &str) -> Result<Value, ClientError>;
    fn inspect_image(&mut self, image_id: &str) -> Result<Value, ClientError>;
}

/// Shared handle toggling whether resolvers perform the slower image
/// sub-lookup (repo digests and tags) on top of container inspection.
///
/// The handle is threaded into each resolver at construction; writes go
/// through [`QueryImageInfo::set`] and are visible to the worker thread
/// with plain atomic ordering.
#[derive(Debug, Clone)]
pub struct QueryImageInfo(Arc<AtomicBool>);

impl QueryImageInfo {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn set(&self, enabled: bool) {
        log::debug!("(docker-meta) setting query_image_info={enabled}");
        self.0.store(enabled, Ordering::Release);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for QueryImageInfo {
    fn default() -> Self {
        Self::new(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub container_port: u16,
    pub host_ip: Ipv4Addr,
    pub host_port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountInfo {
    pub source: String,
    pub destination: String,
    pub mode: String,
    pub rw: bool,
    pub propagation: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthProbeKind {
    Healthcheck,
    LivenessProbe,
    ReadinessProbe,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProbe {
    pub kind: HealthProbeKind,
    pub exe: String,
    pub args: Vec<String>,
}

/// Metadata record resolved for one container.
///
/// `successful` is false when the runtime could not be queried at all;
/// such records are still cached and delivered so that a missing or
/// foreign runtime (e.g. containerd behind docker-style cgroup names)
/// is retried once per TTL window, not on every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub id: ContainerID,
    pub name: String,
    pub is_pod_sandbox: bool,
    pub image: String,
    pub image_id: String,
    pub image_repo: String,
    pub image_tag: String,
    pub image_digest: String,
    pub ip_address: Option<Ipv4Addr>,
    pub port_mappings: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub memory_limit: i64,
    pub swap_limit: i64,
    pub cpu_shares: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub cpuset_cpu_count: Option<u32>,
    pub privileged: bool,
    pub mounts: Vec<MountInfo>,
    pub health_probes: Vec<HealthProbe>,
    pub successful: bool,
}

impl ContainerMetadata {
    /// Creates an empty record for `id` with the runtime's defaults for
    /// the scheduler fields (1024 cpu shares, 100ms cfs period).
    pub fn new(id: ContainerID) -> Self {
        Self {
            id,
            name: String::new(),
            is_pod_sandbox: false,
            image: String::new(),
            image_id: String::new(),
            image_repo: String::new(),
            image_tag: String::new(),
            image_digest: String::new(),
            ip_address: None,
            port_mappings: Vec::new(),
            labels: HashMap::new(),
            env: Vec::new(),
            memory_limit: 0,
            swap_limit: 0,
            cpu_shares: 1024,
            cpu_quota: 0,
            cpu_period: 100_000,
            cpuset_cpu_count: None,
            privileged: false,
            mounts: Vec::new(),
            health_probes: Vec::new(),
            successful: false,
        }
    }
}

/// Resolves [`ContainerMetadata`] by inspecting containers through a
/// [`RuntimeClient`].
pub struct MetadataResolver<C> {
    client: C,
    query_image_info: QueryImageInfo,
    // Ids currently being fetched on this thread; a nested fetch that
    // would re-enter one of them is refused instead of recursing
    // forever.
    in_flight: HashSet<String>,
}

impl<C: RuntimeClient> MetadataResolver<C> {
    pub fn new(client: C, query_image_info: QueryImageInfo) -> Self {
        Self {
            client,
            query_image_info,
            in_flight: HashSet::new(),
        }
    }

    /// Returns a clone of the image-lookup toggle handle.
    pub fn query_image_info(&self) -> QueryImageInfo {
        self.query_image_info.clone()
    }

    fn fetch(&mut self, id: &str, out: &mut ContainerMetadata) -> bool {
        if !self.in_flight.insert(id.to_owned()) {
            log::warn!("(docker-meta) ({id}): refusing nested fetch of an id already being resolved");
            return false;
        }
        let ok = self.fetch_inner(id, out);
        self.in_flight.remove(id);
        ok
    }

    fn fetch_inner(&mut self, id: &str, out: &mut ContainerMetadata) -> bool {
        log::debug!("(docker-meta) ({id}): looking up container info");
        let root = match self.client.inspect_container(id) {
            Ok(root) => root,
            Err(err) => {
                // Not necessarily an error: with containerd as the
                // runtime the cgroup names often look identical to
                // docker's, and this inspection simply has nobody to
                // answer it.
                log::debug!("(docker-meta) ({id}): container inspection failed: {err}");
                return false;
            }
        };

        let config = &root["Config"];
        out.image = str_field(&config["Image"]);
        let image_field = str_field(&root["Image"]);
        out.image_id = image_field
            .split_once(':')
            .map(|(_, rest)| rest.to_owned())
            .unwrap_or_default();

        parse_health_probes(id, config, out);

        // Containers can be spawned with just the image id as the image
        // name, with or without the hash prefix.
        let no_name = (!out.image_id.is_empty() && common_prefix(&out.image, &out.image_id))
            || (!image_field.is_empty() && common_prefix(&out.image, &image_field));

        let query_image_info = self.query_image_info.get();
        if !no_name || !query_image_info {
            (out.image_repo, out.image_tag, out.image_digest) = split_image(&out.image);
        }
        if query_image_info
            && !out.image_id.is_empty()
            && (no_name
                || out.image_digest.is_empty()
                || (!out.image_digest.is_empty() && out.image_tag.is_empty()))
        {
            self.fetch_image_info(id, out);
        }
        if out.image_tag.is_empty() {
            out.image_tag = "latest".to_owned();
        }

        out.name = str_field(&root["Name"]);
        // k8s docker container names can have '/' as the first character.
        if let Some(stripped) = out.name.strip_prefix('/') {
            out.name = stripped.to_owned();
        }
        out.is_pod_sandbox = out.name.starts_with("k8s_POD");

        let net = &root["NetworkSettings"];
        let ip = str_field(&net["IPAddress"]);
        if ip.is_empty() {
            self.fetch_secondary_ip(id, &root, out);
        } else {
            out.ip_address = ip.parse().ok_log_msg("parsing container ip address");
        }

        parse_port_mappings(&net["Ports"], &mut out.port_mappings);

        if let Some(labels) = config["Labels"].as_object() {
            for (key, value) in labels {
                if let Some(value) = value.as_str() {
                    out.labels.insert(key.clone(), value.to_owned());
                }
            }
        }
        if let Some(env) = config["Env"].as_array() {
            out.env = env
                .iter()
                .filter_map(|var| var.as_str().map(str::to_owned))
                .collect();
        }

        let host_config = &root["HostConfig"];
        out.memory_limit = host_config["Memory"].as_i64().unwrap_or(0);
        out.swap_limit = host_config["MemorySwap"].as_i64().unwrap_or(0);
        let cpu_shares = host_config["CpuShares"].as_i64().unwrap_or(0);
        if cpu_shares > 0 {
            out.cpu_shares = cpu_shares;
        }
        out.cpu_quota = host_config["CpuQuota"].as_i64().unwrap_or(0);
        let cpu_period = host_config["CpuPeriod"].as_i64().unwrap_or(0);
        if cpu_period > 0 {
            out.cpu_period = cpu_period;
        }
        let cpuset_cpus = str_field(&host_config["CpusetCpus"]);
        if !cpuset_cpus.is_empty() {
            out.cpuset_cpu_count = count_cpu_list(&cpuset_cpus).ok_log_msg("counting CpusetCpus");
        }
        if let Some(privileged) = host_config["Privileged"].as_bool() {
            out.privileged = privileged;
        }

        parse_mounts(&root["Mounts"], &mut out.mounts);

        log::debug!("(docker-meta) ({id}): metadata fetch complete");
        true
    }

    /// A container sharing another container's network namespace
    /// reports an empty ip; the address lives on the secondary
    /// container named by `NetworkMode`. Fetching it is a blocking call
    /// on this same worker thread, deliberately bypassing the queue — a
    /// second queue trip would deadlock a single-consumer design.
    fn fetch_secondary_ip(&mut self, id: &str, root: &Value, out: &mut ContainerMetadata) {
        let net_mode = str_field(&root["HostConfig"]["NetworkMode"]);
        let Some(secondary_id) = net_mode.strip_prefix("container:") else {
            return;
        };
        log::debug!(
            "(docker-meta) ({id}), secondary ({secondary_id}): doing blocking fetch of secondary container"
        );
        let Some(secondary) =
            ContainerID::new(secondary_id).ok_log_msg("invalid secondary container id")
        else {
            return;
        };
        let mut secondary_meta = ContainerMetadata::new(secondary);
        if self.fetch(secondary_id, &mut secondary_meta) {
            out.ip_address = secondary_meta.ip_address;
        } else {
            log::error!(
                "(docker-meta) ({id}), secondary ({secondary_id}): secondary fetch failed"
            );
        }
    }

    /// Recovers repo, tag and digest from the image document when the
    /// container was started by image id or the name split came out
    /// incomplete. RepoDigests only lists digests for images that went
    /// through a registry; locally built or retagged images may leave
    /// the digest empty.
    fn fetch_image_info(&mut self, id: &str, out: &mut ContainerMetadata) {
        log::debug!(
            "(docker-meta) ({id}) image ({}): fetching image info",
            out.image_id
        );
        let img_root = match self.client.inspect_image(&out.image_id) {
            Ok(img_root) => img_root,
            Err(err) => {
                log::error!(
                    "(docker-meta) ({id}) image ({}): could not fetch image info: {err}",
                    out.image_id
                );
                return;
            }
        };

        let mut digests = HashSet::new();
        if let Some(repo_digests) = img_root["RepoDigests"].as_array() {
            for entry in repo_digests.iter().filter_map(|d| d.as_str()) {
                let Some((repo, digest)) = entry.split_once('@') else {
                    continue;
                };
                digests.insert(digest.to_owned());
                if out.image_repo.is_empty() {
                    out.image_repo = repo.to_owned();
                }
                if entry.contains(&out.image_repo) {
                    out.image_digest = digest.to_owned();
                    break;
                }
            }
        }
        if let Some(repo_tags) = img_root["RepoTags"].as_array() {
            for entry in repo_tags.iter().filter_map(|t| t.as_str()) {
                if out.image_repo.is_empty() {
                    out.image_repo = entry
                        .rsplit_once(':')
                        .map(|(repo, _)| repo.to_owned())
                        .unwrap_or_default();
                }
                if entry.contains(&out.image_repo) {
                    if let Some((_, tag)) = entry.rsplit_once(':') {
                        out.image_tag = tag.to_owned();
                    }
                    break;
                }
            }
        }
        // One repo digest shared by many tags, or a locally retagged
        // image: take the digest when it is unambiguous.
        if out.image_digest.is_empty() && digests.len() == 1 {
            out.image_digest = digests.into_iter().next().unwrap_or_default();
        }
    }
}

impl<C: RuntimeClient> Resolver for MetadataResolver<C> {
    type Key = ContainerID;
    type Value = ContainerMetadata;

    fn resolve(&mut self, key: &ContainerID) -> ContainerMetadata {
        let mut meta = ContainerMetadata::new(key.clone());
        meta.successful = self.fetch(key.as_ref(), &mut meta);
        if !meta.successful {
            log::debug!("(docker-meta) ({key}): returning metadata with successful=false");
        }
        meta
    }
}

fn str_field(value: &Value) -> String {
    value.as_str().unwrap_or_default().to_owned()
}

/// True when the two strings agree on their common prefix, i.e. the
/// shorter is a prefix of the longer.
fn common_prefix(a: &str, b: &str) -> bool {
    let n = a.len().min(b.len());
    a.as_bytes()[..n] == b.as_bytes()[..n]
}

/// Splits an image reference into (repo, tag, digest). The tag is the
/// part after a ':' that follows the last '/', so registry ports are
/// not mistaken for tags; the digest is everything after '@'.
fn split_image(image: &str) -> (String, String, String) {
    let (rest, digest) = match image.split_once('@') {
        Some((rest, digest)) => (rest, digest.to_owned()),
        None => (image, String::new()),
    };
    let name_start = rest.rfind('/').map_or(0, |i| i + 1);
    match rest[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (
                rest[..split].to_owned(),
                rest[split + 1..].to_owned(),
                digest,
            )
        }
        None => (rest.to_owned(), String::new(), digest),
    }
}

/// Removes pairs of matching leading/trailing quote characters.
fn normalize_arg(arg: &str) -> String {
    let mut ret = arg;
    loop {
        let mut chars = ret.chars();
        match (chars.next(), chars.next_back()) {
            (Some(first @ ('"' | '\'')), Some(last)) if first == last => {
                ret = &ret[1..ret.len() - 1];
            }
            _ => break,
        }
    }
    ret.to_owned()
}

fn parse_health_probes(id: &str, config: &Value, out: &mut ContainerMetadata) {
    let mut liveness_readiness_added = false;
    // For containers belonging to a pod, the probes live in a
    // stringified pod spec label rather than the docker healthcheck.
    if let Some(spec) = k8s_pod_spec(config) {
        if spec.get("livenessProbe").is_some() {
            liveness_readiness_added = parse_liveness_readiness_probe(
                id,
                &spec["livenessProbe"],
                HealthProbeKind::LivenessProbe,
                out,
            );
        } else if spec.get("readinessProbe").is_some() {
            liveness_readiness_added = parse_liveness_readiness_probe(
                id,
                &spec["readinessProbe"],
                HealthProbeKind::ReadinessProbe,
                out,
            );
        }
    }
    // Only consider a healthcheck when no liveness/readiness probe was
    // added, so a container never reports both.
    if !liveness_readiness_added && config.get("Healthcheck").is_some() {
        parse_healthcheck(id, &config["Healthcheck"], out);
    }
}

fn k8s_pod_spec(config: &Value) -> Option<Value> {
    let raw = config["Labels"][K8S_POD_SPEC_LABEL].as_str()?;
    if raw.is_empty() {
        return None;
    }
    let cfg: Value = match serde_json::from_str(raw) {
        Ok(cfg) => cfg,
        Err(err) => {
            log::warn!("(docker-meta) could not parse pod config: {err}");
            return None;
        }
    };
    let containers = &cfg["spec"]["containers"];
    if !containers.is_array() {
        return None;
    }
    Some(containers[0].clone())
}

fn parse_liveness_readiness_probe(
    id: &str,
    probe: &Value,
    kind: HealthProbeKind,
    out: &mut ContainerMetadata,
) -> bool {
    let Some(command) = probe["exec"]["command"].as_array() else {
        log::warn!("(docker-meta) ({id}): could not parse liveness/readiness probe");
        return false;
    };
    let mut parts = command
        .iter()
        .filter_map(|part| part.as_str())
        .map(normalize_arg);
    let exe = parts.next().unwrap_or_default();
    let args = parts.collect();
    log::debug!("(docker-meta) ({id}): setting {kind:?} exe={exe}");
    out.health_probes.push(HealthProbe { kind, exe, args });
    true
}

fn parse_healthcheck(id: &str, healthcheck: &Value, out: &mut ContainerMetadata) {
    let Some(test) = healthcheck["Test"].as_array() else {
        log::warn!("(docker-meta) ({id}): could not parse health check (no usable Test property)");
        return;
    };
    if test.len() == 1 {
        if test[0].as_str() != Some("NONE") {
            log::warn!(
                "(docker-meta) ({id}): could not parse health check (expected NONE for single-element Test array)"
            );
        }
        return;
    }
    match test.first().and_then(Value::as_str) {
        Some("CMD") => {
            let exe = normalize_arg(test[1].as_str().unwrap_or_default());
            let args = test[2..]
                .iter()
                .filter_map(|arg| arg.as_str())
                .map(normalize_arg)
                .collect();
            log::debug!("(docker-meta) ({id}): setting healthcheck exe={exe}");
            out.health_probes.push(HealthProbe {
                kind: HealthProbeKind::Healthcheck,
                exe,
                args,
            });
        }
        Some("CMD-SHELL") => {
            log::debug!("(docker-meta) ({id}): setting shell healthcheck");
            out.health_probes.push(HealthProbe {
                kind: HealthProbeKind::Healthcheck,
                exe: "/bin/sh".to_owned(),
                args: vec![
                    "-c".to_owned(),
                    test[1].as_str().unwrap_or_default().to_owned(),
                ],
            });
        }
        _ => log::warn!(
            "(docker-meta) ({id}): could not parse health check (expected CMD/CMD-SHELL)"
        ),
    }
}

fn parse_port_mappings(ports: &Value, out: &mut Vec<PortMapping>) {
    let Some(ports) = ports.as_object() else {
        return;
    };
    for (spec, bindings) in ports {
        let Some(port) = spec.strip_suffix("/tcp") else {
            continue;
        };
        let Ok(container_port) = port.parse::<u16>() else {
            continue;
        };
        let Some(bindings) = bindings.as_array() else {
            continue;
        };
        for binding in bindings {
            let Ok(host_ip) = str_field(&binding["HostIp"]).parse::<Ipv4Addr>() else {
                continue;
            };
            let host_port = str_field(&binding["HostPort"]).parse().unwrap_or(0);
            out.push(PortMapping {
                container_port,
                host_ip,
                host_port,
            });
        }
    }
}

fn parse_mounts(mounts: &Value, out: &mut Vec<MountInfo>) {
    let Some(mounts) = mounts.as_array() else {
        return;
    };
    for mount in mounts {
        out.push(MountInfo {
            source: str_field(&mount["Source"]),
            destination: str_field(&mount["Destination"]),
            mode: str_field(&mount["Mode"]),
            rw: mount["RW"].as_bool().unwrap_or(false),
            propagation: str_field(&mount["Propagation"]),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockClient {
        containers: HashMap<String, Value>,
        images: HashMap<String, Value>,
        container_calls: Arc<AtomicUsize>,
        image_calls: Arc<AtomicUsize>,
    }

    impl RuntimeClient for MockClient {
        fn inspect_container(&mut self, id: &str) -> Result<Value, ClientError> {
            self.container_calls.fetch_add(1, Ordering::SeqCst);
            self.containers
                .get(id)
                .cloned()
                .ok_or_else(|| ClientError::Request {
                    endpoint: format!("/containers/{id}/json"),
                    reason: "no such container".to_owned(),
                })
        }

        fn inspect_image(&mut self, image_id: &str) -> Result<Value, ClientError> {
            self.image_calls.fetch_add(1, Ordering::SeqCst);
            self.images
                .get(image_id)
                .cloned()
                .ok_or_else(|| ClientError::Request {
                    endpoint: format!("/images/{image_id}/json"),
                    reason: "no such image".to_owned(),
                })
        }
    }

    fn resolve(
        client: MockClient,
        query_image_info: bool,
        id: &str,
    ) -> ContainerMetadata {
        let mut resolver = MetadataResolver::new(client, QueryImageInfo::new(query_image_info));
        resolver.resolve(&ContainerID::new(id).unwrap())
    }

    #[test]
    fn test_parse_full_container() {
        let mut client = MockClient::default();
        client.containers.insert(
            "abc".to_owned(),
            json!({
                "Name": "/nginx",
                "Image": "sha256:ffff1234",
                "Config": {
                    "Image": "nginx:1.25",
                    "Labels": {"app": "web"},
                    "Env": ["PATH=/usr/bin", "MODE=prod"],
                    "Healthcheck": {"Test": ["CMD-SHELL", "curl -f http://localhost/"]},
                },
                "NetworkSettings": {
                    "IPAddress": "172.17.0.2",
                    "Ports": {
                        "80/tcp": [{"HostIp": "0.0.0.0", "HostPort": "8080"}],
                        "53/udp": [{"HostIp": "0.0.0.0", "HostPort": "5353"}],
                    },
                },
                "HostConfig": {
                    "Memory": 536870912i64,
                    "MemorySwap": 1073741824i64,
                    "CpuShares": 512,
                    "CpuQuota": 200000,
                    "CpuPeriod": 200000,
                    "CpusetCpus": "0-1",
                    "Privileged": true,
                    "NetworkMode": "default",
                },
                "Mounts": [{
                    "Source": "/data",
                    "Destination": "/var/lib/data",
                    "Mode": "rw",
                    "RW": true,
                    "Propagation": "rprivate",
                }],
            }),
        );

        let meta = resolve(client, false, "abc");

        assert!(meta.successful);
        assert_eq!(meta.name, "nginx");
        assert!(!meta.is_pod_sandbox);
        assert_eq!(meta.image, "nginx:1.25");
        assert_eq!(meta.image_id, "ffff1234");
        assert_eq!(meta.image_repo, "nginx");
        assert_eq!(meta.image_tag, "1.25");
        assert_eq!(meta.ip_address, Some(Ipv4Addr::new(172, 17, 0, 2)));
        assert_eq!(
            meta.port_mappings,
            vec![PortMapping {
                container_port: 80,
                host_ip: Ipv4Addr::new(0, 0, 0, 0),
                host_port: 8080,
            }]
        );
        assert_eq!(meta.labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(meta.env.len(), 2);
        assert_eq!(meta.memory_limit, 536870912);
        assert_eq!(meta.swap_limit, 1073741824);
        assert_eq!(meta.cpu_shares, 512);
        assert_eq!(meta.cpu_quota, 200000);
        assert_eq!(meta.cpu_period, 200000);
        assert_eq!(meta.cpuset_cpu_count, Some(2));
        assert!(meta.privileged);
        assert_eq!(meta.mounts.len(), 1);
        assert_eq!(meta.mounts[0].destination, "/var/lib/data");
        assert_eq!(
            meta.health_probes,
            vec![HealthProbe {
                kind: HealthProbeKind::Healthcheck,
                exe: "/bin/sh".to_owned(),
                args: vec!["-c".to_owned(), "curl -f http://localhost/".to_owned()],
            }]
        );
    }

    #[test]
    fn test_inspection_failure_flags_record() {
        let meta = resolve(MockClient::default(), false, "missing");
        assert!(!meta.successful);
        assert_eq!(meta.id.as_ref(), "missing");
        // Scheduler defaults survive a failed fetch.
        assert_eq!(meta.cpu_shares, 1024);
        assert_eq!(meta.cpu_period, 100_000);
    }

    #[test]
    fn test_secondary_container_ip_is_copied() {
        let mut client = MockClient::default();
        let calls = Arc::clone(&client.container_calls);
        client.containers.insert(
            "main".to_owned(),
            json!({
                "Config": {"Image": "app"},
                "NetworkSettings": {"IPAddress": ""},
                "HostConfig": {"NetworkMode": "container:netns"},
            }),
        );
        client.containers.insert(
            "netns".to_owned(),
            json!({
                "Config": {"Image": "pause"},
                "NetworkSettings": {"IPAddress": "10.0.0.9"},
            }),
        );

        let meta = resolve(client, false, "main");

        assert!(meta.successful);
        assert_eq!(meta.ip_address, Some(Ipv4Addr::new(10, 0, 0, 9)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_secondary_fetch_cycle_is_refused() {
        let mut client = MockClient::default();
        let calls = Arc::clone(&client.container_calls);
        client.containers.insert(
            "loop".to_owned(),
            json!({
                "Config": {"Image": "app"},
                "NetworkSettings": {"IPAddress": ""},
                "HostConfig": {"NetworkMode": "container:loop"},
            }),
        );

        let meta = resolve(client, false, "loop");

        // The nested fetch is refused, the outer one still succeeds.
        assert!(meta.successful);
        assert_eq!(meta.ip_address, None);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_image_info_recovers_repo_tag_and_digest() {
        let mut client = MockClient::default();
        let image_calls = Arc::clone(&client.image_calls);
        client.containers.insert(
            "abc".to_owned(),
            json!({
                "Image": "sha256:abcd",
                "Config": {"Image": "abcd"},
            }),
        );
        client.images.insert(
            "abcd".to_owned(),
            json!({
                "RepoDigests": ["nginx@sha256:123"],
                "RepoTags": ["nginx:1.25"],
            }),
        );

        let meta = resolve(client, true, "abc");

        assert_eq!(meta.image_repo, "nginx");
        assert_eq!(meta.image_tag, "1.25");
        assert_eq!(meta.image_digest, "sha256:123");
        assert_eq!(image_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_image_info_skipped_when_disabled() {
        let mut client = MockClient::default();
        let image_calls = Arc::clone(&client.image_calls);
        client.containers.insert(
            "abc".to_owned(),
            json!({
                "Image": "sha256:abcd",
                "Config": {"Image": "abcd"},
            }),
        );

        let meta = resolve(client, false, "abc");

        assert_eq!(image_calls.load(Ordering::SeqCst), 0);
        assert_eq!(meta.image_repo, "abcd");
        assert_eq!(meta.image_tag, "latest");
    }

    #[test]
    fn test_k8s_probe_wins_over_healthcheck() {
        let pod_spec = json!({
            "spec": {"containers": [{
                "livenessProbe": {"exec": {"command": ["/bin/probe", "-x"]}},
            }]},
        });
        let mut client = MockClient::default();
        client.containers.insert(
            "pod".to_owned(),
            json!({
                "Config": {
                    "Image": "app",
                    "Labels": {
                        "annotation.kubectl.kubernetes.io/last-applied-configuration":
                            pod_spec.to_string(),
                    },
                    "Healthcheck": {"Test": ["CMD", "/bin/true"]},
                },
            }),
        );

        let meta = resolve(client, false, "pod");

        assert_eq!(
            meta.health_probes,
            vec![HealthProbe {
                kind: HealthProbeKind::LivenessProbe,
                exe: "/bin/probe".to_owned(),
                args: vec!["-x".to_owned()],
            }]
        );
    }

    #[test]
    fn test_healthcheck_cmd_normalizes_args() {
        let mut client = MockClient::default();
        client.containers.insert(
            "abc".to_owned(),
            json!({
                "Config": {
                    "Image": "app",
                    "Healthcheck": {"Test": ["CMD", "\"/bin/check\"", "'--fast'"]},
                },
            }),
        );

        let meta = resolve(client, false, "abc");

        assert_eq!(
            meta.health_probes,
            vec![HealthProbe {
                kind: HealthProbeKind::Healthcheck,
                exe: "/bin/check".to_owned(),
                args: vec!["--fast".to_owned()],
            }]
        );
    }

    #[test]
    fn test_healthcheck_none_adds_no_probe() {
        let mut client = MockClient::default();
        client.containers.insert(
            "abc".to_owned(),
            json!({
                "Config": {
                    "Image": "app",
                    "Healthcheck": {"Test": ["NONE"]},
                },
            }),
        );

        let meta = resolve(client, false, "abc");
        assert!(meta.health_probes.is_empty());
    }

    #[test]
    fn test_pod_sandbox_name() {
        let mut client = MockClient::default();
        client.containers.insert(
            "pod".to_owned(),
            json!({
                "Name": "/k8s_POD_web_default",
                "Config": {"Image": "pause"},
            }),
        );

        let meta = resolve(client, false, "pod");
        assert!(meta.is_pod_sandbox);
        assert_eq!(meta.name, "k8s_POD_web_default");
    }

    #[test]
    fn test_query_image_info_handle_is_shared() {
        let resolver = MetadataResolver::new(MockClient::default(), QueryImageInfo::default());
        let handle = resolver.query_image_info();
        assert!(handle.get());
        handle.set(false);
        assert!(!resolver.query_image_info.get());
    }

    #[test]
    fn test_split_image() {
        assert_eq!(
            split_image("nginx"),
            ("nginx".to_owned(), String::new(), String::new())
        );
        assert_eq!(
            split_image("nginx:1.25"),
            ("nginx".to_owned(), "1.25".to_owned(), String::new())
        );
        assert_eq!(
            split_image("repo/app:v2@sha256:d34d"),
            ("repo/app".to_owned(), "v2".to_owned(), "sha256:d34d".to_owned())
        );
        // A registry port is not a tag.
        assert_eq!(
            split_image("localhost:5000/app"),
            ("localhost:5000/app".to_owned(), String::new(), String::new())
        );
    }

    #[test]
    fn test_normalize_arg() {
        assert_eq!(normalize_arg("\"/bin/sh\""), "/bin/sh");
        assert_eq!(normalize_arg("''x''"), "x");
        assert_eq!(normalize_arg("plain"), "plain");
        assert_eq!(normalize_arg("\"unbalanced"), "\"unbalanced");
        assert_eq!(normalize_arg(""), "");
    }
}
