use async_trait::async_trait;
use bollard::container::Config as ContainerConfig;
use bollard::models::{
    ContainerCreateResponse, ContainerInspectResponse, HostConfig, PortBinding, RestartPolicy,
    RestartPolicyNameEnum, SystemInfo,
};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::cache::TtlCache;
use crate::config::Config;
use crate::error::{AppError, Result};

use super::{
    ContainerDetails, ContainerListing, ContainerSpec, Host, HostStats, HostStatus, Orchestrator,
    CPU_PERIOD_US, LABEL_MEMORY_BYTES,
};

const API_KEY_HEADER: &str = "X-API-Key";

/// Seconds the daemon waits before killing a container on stop/restart
const STOP_TIMEOUT_SECS: u32 = 10;

/// Portainer reports endpoint reachability as 1 (up) or 2 (down)
const ENDPOINT_STATUS_UP: i32 = 1;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortainerEndpoint {
    id: i64,
    name: String,
    #[serde(default)]
    status: i32,
}

/// HTTP client for a Portainer server, proxying the Docker Engine API of
/// every registered endpoint.
///
/// GET responses are cached by full URL. A cached `None` is an empty body.
pub struct PortainerClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    cache: TtlCache<String, Option<Vec<u8>>>,
}

impl PortainerClient {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: config.portainer_url.clone(),
            api_key: config.portainer_api_key.clone(),
            cache: TtlCache::new(config.cache_ttl),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn docker_path(endpoint_id: i64, path: &str) -> String {
        format!("/api/endpoints/{}/docker{}", endpoint_id, path)
    }

    async fn get_raw(&self, path: &str) -> Result<Option<Vec<u8>>> {
        let url = self.url(path);

        if let Some(cached) = self.cache.get(&url) {
            debug!("Cache hit: {}", url);
            return Ok(cached);
        }

        let response = self
            .client
            .get(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        let body = Self::read_body(response).await?;

        self.cache.insert(url, body.clone());
        Ok(body)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.get_raw(path).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                AppError::Internal(format!("Failed to decode response from {}: {}", path, e))
            }),
            None => Ok(None),
        }
    }

    /// Non-GET request. Never touches the cache.
    async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<&serde_json::Value>,
    ) -> Result<Option<Vec<u8>>> {
        let mut request = self
            .client
            .request(method, self.url(path))
            .header(API_KEY_HEADER, &self.api_key);

        if !query.is_empty() {
            request = request.query(query);
        }

        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await?;
        Self::read_body(response).await
    }

    async fn read_body(response: reqwest::Response) -> Result<Option<Vec<u8>>> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::OrchestrationApi {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            Ok(None)
        } else {
            Ok(Some(bytes.to_vec()))
        }
    }

    /// Forget cached views of a container after it has been mutated
    fn forget_container(&self, container_id: &str) {
        self.cache.invalidate_matching(container_id);
        self.cache.invalidate_matching("/containers/json");
    }

    async fn fetch_host_stats(&self, endpoint_id: i64) -> Result<HostStats> {
        let info: SystemInfo = self
            .get_json(&Self::docker_path(endpoint_id, "/info"))
            .await?
            .ok_or_else(|| AppError::Internal("Empty docker info response".to_string()))?;

        let running = self.list_containers(endpoint_id, false).await?;
        let memory_used = running
            .iter()
            .filter_map(|c| c.labels.get(LABEL_MEMORY_BYTES))
            .filter_map(|v| v.parse::<i64>().ok())
            .sum();

        Ok(HostStats {
            cpu_cores: info.ncpu.unwrap_or(0),
            memory_total: info.mem_total.unwrap_or(0),
            memory_used,
        })
    }
}

#[async_trait]
impl Orchestrator for PortainerClient {
    fn invalidate_cache(&self, pattern: Option<&str>) -> usize {
        match pattern {
            Some(pattern) => self.cache.invalidate_matching(pattern),
            None => self.cache.invalidate_all(),
        }
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        let endpoints: Vec<PortainerEndpoint> =
            self.get_json("/api/endpoints").await?.unwrap_or_default();

        Ok(endpoints
            .into_iter()
            .map(|e| Host {
                endpoint_id: e.id,
                name: e.name,
                status: if e.status == ENDPOINT_STATUS_UP {
                    HostStatus::Up
                } else {
                    HostStatus::Down
                },
            })
            .collect())
    }

    async fn get_host_stats(&self, endpoint_id: i64) -> Option<HostStats> {
        match self.fetch_host_stats(endpoint_id).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!("Failed to get stats for endpoint {}: {}", endpoint_id, e);
                None
            }
        }
    }

    async fn create_container(&self, endpoint_id: i64, spec: &ContainerSpec) -> Result<String> {
        let env: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let port_key = format!("{}/tcp", spec.container_port);
        let mut port_bindings = HashMap::new();
        port_bindings.insert(
            port_key.clone(),
            Some(vec![PortBinding {
                host_ip: None,
                host_port: Some("0".to_string()), // Let Docker assign a port
            }]),
        );

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: Some(spec.binds.clone()),
            memory: Some(spec.memory_bytes),
            cpu_period: Some(CPU_PERIOD_US),
            cpu_quota: Some(spec.cpu_quota),
            restart_policy: Some(RestartPolicy {
                name: Some(RestartPolicyNameEnum::UNLESS_STOPPED),
                maximum_retry_count: None,
            }),
            ..Default::default()
        };

        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(port_key, HashMap::new());

        let config = ContainerConfig {
            image: Some(spec.image.clone()),
            env: Some(env),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            labels: Some(spec.labels.clone()),
            ..Default::default()
        };

        let body = serde_json::to_value(&config)
            .map_err(|e| AppError::Internal(format!("Failed to encode container spec: {}", e)))?;

        let path = Self::docker_path(endpoint_id, "/containers/create");
        let bytes = self
            .send(Method::POST, &path, &[("name", spec.name.as_str())], Some(&body))
            .await?
            .ok_or_else(|| AppError::Internal("Empty container create response".to_string()))?;
        let created: ContainerCreateResponse = serde_json::from_slice(&bytes).map_err(|e| {
            AppError::Internal(format!("Failed to decode container create response: {}", e))
        })?;

        for warning in &created.warnings {
            warn!("Container {} create warning: {}", spec.name, warning);
        }

        self.cache.invalidate_matching("/containers/json");
        info!(
            "Created container {} ({}) on endpoint {}",
            spec.name, created.id, endpoint_id
        );

        Ok(created.id)
    }

    async fn start_container(&self, endpoint_id: i64, container_id: &str) -> Result<()> {
        let path = Self::docker_path(endpoint_id, &format!("/containers/{}/start", container_id));
        self.send(Method::POST, &path, &[], None).await?;
        self.forget_container(container_id);

        info!("Started container: {}", container_id);
        Ok(())
    }

    async fn stop_container(&self, endpoint_id: i64, container_id: &str) -> Result<()> {
        info!("Stopping container: {}", container_id);

        let path = Self::docker_path(endpoint_id, &format!("/containers/{}/stop", container_id));
        let timeout = STOP_TIMEOUT_SECS.to_string();

        let result = match self.send(Method::POST, &path, &[("t", timeout.as_str())], None).await {
            Ok(_) => {
                info!("Stopped container: {}", container_id);
                Ok(())
            }
            Err(AppError::OrchestrationApi { status: 304, .. }) => {
                warn!("Container {} was already stopped", container_id);
                Ok(())
            }
            Err(e) => Err(e),
        };

        self.forget_container(container_id);
        result
    }

    async fn restart_container(&self, endpoint_id: i64, container_id: &str) -> Result<()> {
        let path =
            Self::docker_path(endpoint_id, &format!("/containers/{}/restart", container_id));
        let timeout = STOP_TIMEOUT_SECS.to_string();
        self.send(Method::POST, &path, &[("t", timeout.as_str())], None).await?;
        self.forget_container(container_id);

        info!("Restarted container: {}", container_id);
        Ok(())
    }

    async fn remove_container(
        &self,
        endpoint_id: i64,
        container_id: &str,
        force: bool,
    ) -> Result<()> {
        info!("Removing container: {}", container_id);

        let path = Self::docker_path(endpoint_id, &format!("/containers/{}", container_id));
        let force = force.to_string();
        self.send(Method::DELETE, &path, &[("force", force.as_str()), ("v", "true")], None)
            .await?;
        self.forget_container(container_id);

        info!("Removed container: {}", container_id);
        Ok(())
    }

    async fn get_container(
        &self,
        endpoint_id: i64,
        container_id: &str,
    ) -> Result<ContainerDetails> {
        let path = Self::docker_path(endpoint_id, &format!("/containers/{}/json", container_id));
        let inspect: ContainerInspectResponse = self
            .get_json(&path)
            .await?
            .ok_or_else(|| AppError::Internal("Empty container inspect response".to_string()))?;

        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);

        let ports = inspect
            .network_settings
            .and_then(|ns| ns.ports)
            .unwrap_or_default()
            .into_iter()
            .map(|(key, bindings)| {
                let host_port = bindings
                    .and_then(|b| b.into_iter().find_map(|binding| binding.host_port))
                    .and_then(|port| port.parse::<u16>().ok());
                (key, host_port)
            })
            .collect();

        let labels = inspect
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default();

        Ok(ContainerDetails {
            id: inspect.id.unwrap_or_else(|| container_id.to_string()),
            running,
            ports,
            labels,
        })
    }

    async fn list_containers(&self, endpoint_id: i64, all: bool) -> Result<Vec<ContainerListing>> {
        let path = Self::docker_path(
            endpoint_id,
            &format!("/containers/json?all={}", if all { 1 } else { 0 }),
        );
        Ok(self.get_json(&path).await?.unwrap_or_default())
    }

    async fn get_container_logs(
        &self,
        endpoint_id: i64,
        container_id: &str,
        tail: u32,
    ) -> Result<String> {
        let path = Self::docker_path(
            endpoint_id,
            &format!(
                "/containers/{}/logs?stdout=1&stderr=1&tail={}",
                container_id, tail
            ),
        );
        let raw = self.get_raw(&path).await?.unwrap_or_default();
        Ok(demux_log_stream(&raw))
    }
}

/// Strip Docker's multiplexed-stream frame headers.
///
/// Non-TTY containers prefix each chunk with `[stream, 0, 0, 0, len_be32]`.
/// Anything that does not parse as a frame is passed through unchanged.
fn demux_log_stream(raw: &[u8]) -> String {
    let mut out = Vec::with_capacity(raw.len());
    let mut rest = raw;

    while rest.len() >= 8 && rest[0] <= 2 && rest[1..4] == [0, 0, 0] {
        let size = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let end = (8 + size).min(rest.len());
        out.extend_from_slice(&rest[8..end]);
        rest = &rest[end..];
    }
    out.extend_from_slice(rest);

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> PortainerClient {
        let mut config = Config::for_tests();
        config.portainer_url = server.uri();
        PortainerClient::new(&config).unwrap()
    }

    fn frame(stream: u8, text: &str) -> Vec<u8> {
        let mut out = vec![stream, 0, 0, 0];
        out.extend_from_slice(&(text.len() as u32).to_be_bytes());
        out.extend_from_slice(text.as_bytes());
        out
    }

    #[test]
    fn test_demux_multiplexed_stream() {
        let mut raw = frame(1, "hello\n");
        raw.extend(frame(2, "oops\n"));
        assert_eq!(demux_log_stream(&raw), "hello\noops\n");
    }

    #[test]
    fn test_demux_passes_tty_output_through() {
        assert_eq!(demux_log_stream(b"plain line\n"), "plain line\n");
    }

    #[tokio::test]
    async fn test_list_hosts_maps_status_and_sends_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/endpoints"))
            .and(header("X-API-Key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Id": 1, "Name": "alpha", "Status": 1},
                {"Id": 2, "Name": "beta", "Status": 2}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let hosts = client.list_hosts().await.unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0].status, HostStatus::Up);
        assert_eq!(hosts[1].status, HostStatus::Down);

        let available = client.list_available_hosts().await.unwrap();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].name, "alpha");
    }

    #[tokio::test]
    async fn test_get_requests_are_cached_until_invalidated() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/endpoints"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.list_hosts().await.unwrap();
        client.list_hosts().await.unwrap();

        assert_eq!(client.invalidate_cache(Some("/api/endpoints")), 1);
        client.list_hosts().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_success_status_carries_code_and_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/endpoints/3/docker/containers/abc/start"))
            .respond_with(ResponseTemplate::new(500).set_body_string("daemon exploded"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let err = client.start_container(3, "abc").await.unwrap_err();
        match err {
            AppError::OrchestrationApi { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body, "daemon exploded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_body_is_not_a_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/endpoints/3/docker/containers/abc/restart"))
            .and(query_param("t", "10"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.restart_container(3, "abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_treats_not_modified_as_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/endpoints/3/docker/containers/abc/stop"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let client = client_for(&server);
        client.stop_container(3, "abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_create_container_sends_docker_config() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/endpoints/7/docker/containers/create"))
            .and(query_param("name", "tenant-u1-abc123"))
            .and(body_partial_json(json!({
                "Image": "gateway:test",
                "HostConfig": {
                    "Memory": 1073741824,
                    "CpuPeriod": 100000,
                    "CpuQuota": 100000,
                    "RestartPolicy": {"Name": "unless-stopped"},
                    "PortBindings": {"18789/tcp": [{"HostPort": "0"}]}
                }
            })))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"Id": "c-1", "Warnings": []})),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let spec = ContainerSpec {
            name: "tenant-u1-abc123".to_string(),
            image: "gateway:test".to_string(),
            env: vec![("GATEWAY_PORT".to_string(), "18789".to_string())],
            labels: HashMap::new(),
            container_port: 18789,
            binds: vec!["/srv/tenants/u1-abc123:/data".to_string()],
            memory_bytes: 1024 * 1024 * 1024,
            cpu_quota: 100_000,
        };
        let id = client.create_container(7, &spec).await.unwrap();
        assert_eq!(id, "c-1");
    }

    #[tokio::test]
    async fn test_container_name_is_query_encoded() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/endpoints/7/docker/containers/create"))
            .and(query_param("name", "team a&b-bot"))
            .respond_with(
                ResponseTemplate::new(201).set_body_json(json!({"Id": "c-9", "Warnings": []})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/api/endpoints/7/docker/containers/c-9"))
            .and(query_param("force", "true"))
            .and(query_param("v", "true"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let spec = ContainerSpec {
            name: "team a&b-bot".to_string(),
            image: "gateway:test".to_string(),
            env: Vec::new(),
            labels: HashMap::new(),
            container_port: 18789,
            binds: Vec::new(),
            memory_bytes: 512 * 1024 * 1024,
            cpu_quota: 50_000,
        };
        let id = client.create_container(7, &spec).await.unwrap();
        assert_eq!(id, "c-9");
        client.remove_container(7, &id, true).await.unwrap();
    }

    #[tokio::test]
    async fn test_get_container_reads_running_flag_and_port() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/endpoints/7/docker/containers/c-1/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Id": "c-1",
                "State": {"Running": true},
                "Config": {"Labels": {"tenant.instance_id": "u1-abc123"}},
                "NetworkSettings": {
                    "Ports": {"18789/tcp": [{"HostIp": "0.0.0.0", "HostPort": "40213"}]}
                }
            })))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let details = client.get_container(7, "c-1").await.unwrap();
        assert!(details.running);
        assert_eq!(details.host_port(18789), Some(40213));
        assert_eq!(
            details.labels.get("tenant.instance_id").map(String::as_str),
            Some("u1-abc123")
        );
    }

    #[tokio::test]
    async fn test_host_stats_sum_memory_reservations() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/endpoints/7/docker/info"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"NCPU": 8, "MemTotal": 8589934592i64})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/endpoints/7/docker/containers/json"))
            .and(query_param("all", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"Id": "a", "Labels": {"tenant.memory_bytes": "536870912"}},
                {"Id": "b", "Labels": {"tenant.memory_bytes": "1073741824"}},
                {"Id": "c", "Labels": {}}
            ])))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let stats = client.get_host_stats(7).await.unwrap();
        assert_eq!(stats.cpu_cores, 8);
        assert_eq!(stats.memory_total, 8589934592);
        assert_eq!(stats.memory_used, 1610612736);
    }

    #[tokio::test]
    async fn test_host_stats_failure_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/endpoints/9/docker/info"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(client.get_host_stats(9).await.is_none());
    }
}
