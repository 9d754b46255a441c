use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chaos_core::config::DiscoveryConfig;
use chaos_core::{ChaosError, Result, ServiceDescriptor};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tokio::sync::Mutex;

use super::RegistryClient;

/// Registry backed by etcd's v3 JSON gateway.
///
/// Each node is a single key `<prefix>/<name>/<node_id>` bound to an etcd
/// lease. The first registration grants the lease and writes the key; later
/// registrations only send a keepalive. If the lease has expired on the etcd
/// side a new one is granted, the old one is revoked and the same key is
/// rewritten, so a node never appears twice.
///
/// Calls go to the endpoints in order. Unreachable endpoints and 5xx replies
/// fall through to the next endpoint; any other reply is final.
pub struct EtcdRegistry {
    client: reqwest::Client,
    endpoints: Vec<String>,
    key_prefix: String,
    leases: Mutex<HashMap<String, i64>>,
}

impl EtcdRegistry {
    /// Create a client for the given endpoints.
    pub fn new(
        endpoints: Vec<String>,
        key_prefix: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(ChaosError::Config(
                "etcd registry needs at least one endpoint".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ChaosError::Http(e.to_string()))?;

        Ok(Self {
            client,
            endpoints: endpoints
                .into_iter()
                .map(|e| normalize_endpoint(&e))
                .collect(),
            key_prefix: key_prefix.into(),
            leases: Mutex::new(HashMap::new()),
        })
    }

    /// Create a client from discovery configuration.
    pub fn from_config(config: &DiscoveryConfig) -> Result<Self> {
        Self::new(
            config.endpoints.clone(),
            config.key_prefix.clone(),
            config.call_timeout(),
        )
    }

    /// Normalized endpoint list.
    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    async fn register_node(&self, descriptor: &ServiceDescriptor, ttl: Duration) -> Result<()> {
        let key = descriptor.registry_key(&self.key_prefix);
        let mut leases = self.leases.lock().await;

        if let Some(&lease_id) = leases.get(&key) {
            match self.keepalive(lease_id).await {
                Ok(remaining) if remaining > 0 => return Ok(()),
                Ok(_) => {
                    tracing::warn!(key = %key, lease_id, "etcd lease expired, re-granting");
                }
                Err(e) => {
                    tracing::warn!(key = %key, lease_id, error = %e, "etcd keepalive failed, re-granting");
                }
            }
            leases.remove(&key);
            self.revoke(lease_id).await;
        }

        let lease_id = self.grant(ttl).await?;
        let value = serde_json::to_vec(descriptor)?;
        self.call(
            "/v3/kv/put",
            json!({
                "key": BASE64.encode(key.as_bytes()),
                "value": BASE64.encode(value),
                "lease": lease_id.to_string(),
            }),
        )
        .await?;

        tracing::debug!(key = %key, lease_id, ttl_secs = ttl.as_secs(), "etcd key written");
        leases.insert(key, lease_id);
        Ok(())
    }

    async fn deregister_node(&self, descriptor: &ServiceDescriptor) -> Result<()> {
        let key = descriptor.registry_key(&self.key_prefix);
        let lease_id = self.leases.lock().await.remove(&key);

        let deleted = self
            .call(
                "/v3/kv/deleterange",
                json!({ "key": BASE64.encode(key.as_bytes()) }),
            )
            .await;

        if let Some(lease_id) = lease_id {
            self.revoke(lease_id).await;
        }

        deleted.map(|_| ())
    }

    /// Best-effort; a lease that cannot be revoked still expires with its TTL.
    async fn revoke(&self, lease_id: i64) {
        if let Err(e) = self
            .call("/v3/lease/revoke", json!({ "ID": lease_id.to_string() }))
            .await
        {
            tracing::debug!(lease_id, error = %e, "etcd lease revoke failed");
        }
    }

    async fn grant(&self, ttl: Duration) -> Result<i64> {
        let body = self
            .call(
                "/v3/lease/grant",
                json!({ "TTL": ttl.as_secs().max(1).to_string(), "ID": "0" }),
            )
            .await?;

        let grant: LeaseGrant = serde_json::from_value(body)?;
        if !grant.error.is_empty() {
            return Err(ChaosError::Registry(format!(
                "lease grant rejected: {}",
                grant.error
            )));
        }
        if grant.id == 0 {
            return Err(ChaosError::Registry(
                "lease grant returned no lease id".to_string(),
            ));
        }
        Ok(grant.id)
    }

    /// Returns the remaining TTL in seconds; zero means the lease is gone.
    async fn keepalive(&self, lease_id: i64) -> Result<i64> {
        let body = self
            .call("/v3/lease/keepalive", json!({ "ID": lease_id.to_string() }))
            .await?;

        let reply: KeepAliveReply = serde_json::from_value(body)?;
        Ok(reply.result.map(|r| r.ttl).unwrap_or(0))
    }

    /// POST `body` to `path`, trying endpoints in order until one answers.
    async fn call(&self, path: &str, body: Value) -> Result<Value> {
        let mut last_error = None;

        for endpoint in &self.endpoints {
            let url = format!("{}{}", endpoint, path);
            let response = match self.client.post(&url).json(&body).send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "etcd endpoint unreachable");
                    last_error = Some(ChaosError::Http(format!("{}: {}", url, e)));
                    continue;
                }
            };

            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| ChaosError::Http(format!("{}: {}", url, e)))?;

            if status.is_server_error() {
                tracing::debug!(url = %url, %status, "etcd endpoint failed, trying next");
                last_error = Some(ChaosError::Registry(format!(
                    "{} returned {}: {}",
                    url,
                    status,
                    text.trim()
                )));
                continue;
            }

            if !status.is_success() {
                return Err(ChaosError::Registry(format!(
                    "{} returned {}: {}",
                    path,
                    status,
                    text.trim()
                )));
            }

            return parse_gateway_body(&text);
        }

        Err(last_error
            .unwrap_or_else(|| ChaosError::Registry("no etcd endpoints configured".to_string())))
    }
}

impl RegistryClient for EtcdRegistry {
    fn backend(&self) -> &'static str {
        "etcd"
    }

    fn register<'a>(
        &'a self,
        descriptor: &'a ServiceDescriptor,
        ttl: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.register_node(descriptor, ttl))
    }

    fn deregister<'a>(
        &'a self,
        descriptor: &'a ServiceDescriptor,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.deregister_node(descriptor))
    }
}

fn normalize_endpoint(endpoint: &str) -> String {
    let endpoint = endpoint.trim().trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{}", endpoint)
    }
}

/// Streaming endpoints (keepalive) answer with one JSON object per line.
fn parse_gateway_body(text: &str) -> Result<Value> {
    let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("{}");
    let value: Value = serde_json::from_str(first)?;

    if let Some(error) = value.get("error") {
        let message = value
            .get("message")
            .or_else(|| error.get("message"))
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(ChaosError::Registry(message));
    }

    Ok(value)
}

#[derive(Debug, Deserialize)]
struct LeaseGrant {
    #[serde(rename = "ID", default, deserialize_with = "int64")]
    id: i64,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct KeepAliveReply {
    #[serde(default)]
    result: Option<KeepAliveResult>,
}

#[derive(Debug, Deserialize)]
struct KeepAliveResult {
    #[serde(rename = "TTL", default, deserialize_with = "int64")]
    ttl: i64,
}

/// The gateway encodes int64 fields as JSON strings.
fn int64<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Int64 {
        Number(i64),
        Text(String),
    }

    match Int64::deserialize(deserializer)? {
        Int64::Number(n) => Ok(n),
        Int64::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
