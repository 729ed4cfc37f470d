//! JSON/REST implementation of [`RemoteStore`]
//!
//! Objects are addressed by policy path under `/policy/api/v1`. Writes are
//! `PATCH` (create-or-update) followed by a `GET` to return the realized
//! object; listing uses the search API filtered by the cluster tag.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::{BackendVersion, RemoteKind, RemoteObject, RemoteStore, Tag, TAG_SCOPE_CLUSTER};
use crate::error::{Error, Result};

const POLICY_API_PREFIX: &str = "/policy/api/v1";
const VERSION_ENDPOINT: &str = "/api/v1/node/version";
const VERSION_CACHE_TTL: Duration = Duration::from_secs(300);

/// Connection settings for [`RestBackend`]
#[derive(Clone, Debug)]
pub struct RestBackendConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Cluster name written into the ownership tag
    pub cluster: String,
    pub request_timeout: Duration,
}

pub struct RestBackend {
    client: Client,
    config: RestBackendConfig,
    version: RwLock<Option<(Instant, BackendVersion)>>,
}

#[derive(Deserialize)]
struct SearchPage {
    #[serde(default)]
    results: Vec<Value>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct NodeVersion {
    node_version: String,
}

impl RestBackend {
    pub fn new(config: RestBackendConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(Error::HttpError)?;

        Ok(Self {
            client,
            config,
            version: RwLock::new(None),
        })
    }

    fn request(&self, method: Method, endpoint: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.base_url.trim_end_matches('/'), endpoint);
        self.client
            .request(method, url)
            .basic_auth(&self.config.username, Some(&self.config.password))
    }

    fn policy_endpoint(path: &str) -> String {
        format!("{}{}", POLICY_API_PREFIX, path)
    }

    /// Send a request and map non-success answers to [`Error::Backend`]
    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response.text().await.unwrap_or_default();
        Err(Error::Backend {
            status: status.as_u16(),
            message,
        })
    }

    fn search_query(&self, kind: RemoteKind) -> String {
        format!(
            "resource_type:{} AND tags.scope:{} AND tags.tag:{}",
            kind.resource_type(),
            escape_query(TAG_SCOPE_CLUSTER),
            escape_query(&self.config.cluster)
        )
    }
}

/// The search API treats `/` and `:` as syntax
fn escape_query(value: &str) -> String {
    value.replace('/', "\\/").replace(':', "\\:")
}

/// Wire form of an object: the body plus the common envelope fields
fn to_wire(object: &RemoteObject) -> Value {
    let mut map = match &object.body {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    map.insert("id".into(), Value::String(object.id.clone()));
    map.insert(
        "resource_type".into(),
        Value::String(object.kind.resource_type().to_string()),
    );
    if let Some(name) = &object.display_name {
        map.insert("display_name".into(), Value::String(name.clone()));
    }
    map.insert(
        "tags".into(),
        serde_json::to_value(&object.tags).unwrap_or(Value::Array(Vec::new())),
    );
    Value::Object(map)
}

fn from_wire(kind: RemoteKind, value: Value) -> Result<RemoteObject> {
    let Value::Object(mut map) = value else {
        return Err(Error::ContractViolation(format!(
            "{} response is not an object",
            kind
        )));
    };

    let path = match map.remove("path") {
        Some(Value::String(path)) => path,
        _ => {
            return Err(Error::ContractViolation(format!(
                "{} response has no path",
                kind
            )))
        }
    };
    let id = match map.remove("id") {
        Some(Value::String(id)) => id,
        _ => path.rsplit('/').next().unwrap_or_default().to_string(),
    };
    let display_name = match map.remove("display_name") {
        Some(Value::String(name)) => Some(name),
        _ => None,
    };
    let tags: Vec<Tag> = match map.remove("tags") {
        Some(tags) => serde_json::from_value(tags)?,
        None => Vec::new(),
    };
    map.remove("resource_type");

    Ok(RemoteObject {
        kind,
        id,
        path,
        display_name,
        tags,
        body: Value::Object(map),
    })
}

#[async_trait]
impl RemoteStore for RestBackend {
    async fn create_or_update(&self, object: &RemoteObject) -> Result<RemoteObject> {
        let endpoint = Self::policy_endpoint(&object.path);
        debug!("PATCH {}", endpoint);
        self.send(self.request(Method::PATCH, &endpoint).json(&to_wire(object)))
            .await?;

        self.get(object.kind, &object.path).await?.ok_or_else(|| {
            Error::ContractViolation(format!(
                "{} {} missing right after write",
                object.kind, object.path
            ))
        })
    }

    async fn get(&self, kind: RemoteKind, path: &str) -> Result<Option<RemoteObject>> {
        let endpoint = Self::policy_endpoint(path);
        match self.send(self.request(Method::GET, &endpoint)).await {
            Ok(response) => {
                let value: Value = response.json().await?;
                from_wire(kind, value).map(Some)
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, kind: RemoteKind, path: &str) -> Result<()> {
        let endpoint = Self::policy_endpoint(path);
        debug!("DELETE {} {}", kind, endpoint);
        match self.send(self.request(Method::DELETE, &endpoint)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!("{} {} already gone", kind, path);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn list_tracked(&self, kind: RemoteKind) -> Result<Vec<RemoteObject>> {
        let endpoint = Self::policy_endpoint("/search/query");
        let query = self.search_query(kind);
        let mut cursor: Option<String> = None;
        let mut objects = Vec::new();

        loop {
            let mut request = self
                .request(Method::GET, &endpoint)
                .query(&[("query", query.as_str())]);
            if let Some(c) = &cursor {
                request = request.query(&[("cursor", c.as_str())]);
            }

            let page: SearchPage = self.send(request).await?.json().await?;
            for value in page.results {
                match from_wire(kind, value) {
                    Ok(object) => objects.push(object),
                    Err(e) => warn!("Skipping unreadable {} in search results: {}", kind, e),
                }
            }

            match page.cursor {
                Some(next) if !next.is_empty() && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next)
                }
                _ => break,
            }
        }

        debug!("Listed {} tracked {} object(s)", objects.len(), kind);
        Ok(objects)
    }

    async fn version(&self) -> Result<BackendVersion> {
        if let Some((fetched_at, version)) = *self.version.read().await {
            if fetched_at.elapsed() < VERSION_CACHE_TTL {
                return Ok(version);
            }
        }

        let response = self.send(self.request(Method::GET, VERSION_ENDPOINT)).await?;
        if response.status() == StatusCode::NO_CONTENT {
            return Err(Error::ContractViolation(
                "backend returned no version".to_string(),
            ));
        }
        let node: NodeVersion = response.json().await?;
        let version: BackendVersion = node.node_version.parse()?;

        *self.version.write().await = Some((Instant::now(), version));
        debug!("Backend version {}", version);
        Ok(version)
    }
}
