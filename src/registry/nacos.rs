//! Nacos naming-service backend.
//!
//! Queries the Nacos open API (`/nacos/v1/ns/instance/list`) and maps each host
//! to an [`Instance`]. Disabled hosts are reported as unhealthy so the load
//! balancer skips them.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::RegistryConfig;
use crate::registry::{Instance, RegistryBackend, RegistryError};

#[derive(Debug, Deserialize)]
struct InstanceList {
    #[serde(default)]
    hosts: Vec<NacosHost>,
}

#[derive(Debug, Deserialize)]
struct NacosHost {
    ip: String,
    port: u16,
    #[serde(default = "default_true")]
    healthy: bool,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_true() -> bool {
    true
}

impl From<NacosHost> for Instance {
    fn from(host: NacosHost) -> Self {
        Instance {
            address: format!("http://{}:{}", host.ip, host.port),
            healthy: host.healthy && host.enabled,
        }
    }
}

/// Registry backend backed by a Nacos server.
#[derive(Debug, Clone)]
pub struct NacosRegistry {
    client: reqwest::Client,
    base_url: String,
    namespace: String,
    timeout: Duration,
}

impl NacosRegistry {
    pub fn new(config: &RegistryConfig) -> Result<Self, RegistryError> {
        let timeout = Duration::from_millis(config.timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Backend(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.nacos_address.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            timeout,
        })
    }
}

#[async_trait]
impl RegistryBackend for NacosRegistry {
    async fn list_instances(&self, service: &str) -> Result<Vec<Instance>, RegistryError> {
        let url = format!("{}/nacos/v1/ns/instance/list", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("serviceName", service), ("namespaceId", self.namespace.as_str())])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RegistryError::Timeout(self.timeout.as_millis() as u64)
                } else {
                    RegistryError::Backend(e.to_string())
                }
            })?;

        if !response.status().is_success() {
            return Err(RegistryError::Backend(format!(
                "nacos answered {} for {service}",
                response.status()
            )));
        }

        let list: InstanceList = response
            .json()
            .await
            .map_err(|e| RegistryError::Backend(format!("invalid nacos payload: {e}")))?;

        Ok(list.hosts.into_iter().map(Instance::from).collect())
    }

    fn name(&self) -> &'static str {
        "nacos"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryBackendKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answer one request with `status` and `body` after `delay`. The handle
    /// yields the request line that was received.
    async fn serve_once(status: u16, body: &'static str, delay: Duration) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }

            tokio::time::sleep(delay).await;
            let response = format!(
                "HTTP/1.1 {status} Status\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;

            String::from_utf8_lossy(&buf).lines().next().unwrap_or_default().to_string()
        });
        (base, handle)
    }

    fn registry(base: &str, timeout_ms: u64) -> NacosRegistry {
        NacosRegistry::new(&RegistryConfig {
            backend: RegistryBackendKind::Nacos,
            nacos_address: format!("{base}/"),
            namespace: "dev".to_string(),
            timeout_ms,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn lists_instances_of_a_namespace() {
        let body = r#"{"hosts": [{"ip": "10.0.0.1", "port": 8081}, {"ip": "10.0.0.2", "port": 8082, "healthy": false}]}"#;
        let (base, seen) = serve_once(200, body, Duration::ZERO).await;

        let instances = registry(&base, 1000).list_instances("orders").await.unwrap();
        assert_eq!(
            instances,
            vec![Instance::healthy("http://10.0.0.1:8081"), Instance::unhealthy("http://10.0.0.2:8082")]
        );
        assert_eq!(
            seen.await.unwrap(),
            "GET /nacos/v1/ns/instance/list?serviceName=orders&namespaceId=dev HTTP/1.1"
        );
    }

    #[tokio::test]
    async fn error_status_is_a_backend_error() {
        let (base, _seen) = serve_once(500, "{}", Duration::ZERO).await;

        let err = registry(&base, 1000).list_instances("orders").await.unwrap_err();
        assert!(matches!(&err, RegistryError::Backend(msg) if msg.contains("500")), "{err:?}");
    }

    #[tokio::test]
    async fn unparseable_payload_is_a_backend_error() {
        let (base, _seen) = serve_once(200, "not json", Duration::ZERO).await;

        let err = registry(&base, 1000).list_instances("orders").await.unwrap_err();
        assert!(matches!(&err, RegistryError::Backend(msg) if msg.contains("invalid nacos payload")), "{err:?}");
    }

    #[tokio::test]
    async fn slow_server_is_a_timeout() {
        let (base, seen) = serve_once(200, r#"{"hosts": []}"#, Duration::from_secs(2)).await;

        let err = registry(&base, 100).list_instances("orders").await.unwrap_err();
        assert_eq!(err, RegistryError::Timeout(100));
        seen.abort();
    }

    #[test]
    fn maps_hosts_to_instances() {
        let raw = r#"{
            "name": "DEFAULT_GROUP@@service1",
            "hosts": [
                {"ip": "10.0.0.1", "port": 8081, "healthy": true, "enabled": true},
                {"ip": "10.0.0.2", "port": 8082, "healthy": true, "enabled": false},
                {"ip": "10.0.0.3", "port": 8083, "healthy": false}
            ]
        }"#;
        let list: InstanceList = serde_json::from_str(raw).unwrap();
        let instances: Vec<Instance> = list.hosts.into_iter().map(Instance::from).collect();

        assert_eq!(instances[0], Instance::healthy("http://10.0.0.1:8081"));
        assert!(!instances[1].healthy);
        assert!(!instances[2].healthy);
    }
}
