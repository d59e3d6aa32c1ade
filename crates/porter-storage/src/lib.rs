//! Entity document store contract, in-memory reference store, and HTTP fetch
//! utilities for the task snapshot porter.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Context;
use porter_core::{Entity, EntityKey, KeyId, Kind};
use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info_span;

pub const CRATE_NAME: &str = "porter-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Key-value document store with parent-scoped hierarchical keys.
///
/// `create` constructs a handle with a valid key (allocating a numeric id when
/// no local key name is given) but does not persist it; `save` writes, and
/// repeated saves overwrite. This split carries the two-phase entity
/// lifecycle: reserve a key, persist, populate, persist again.
pub trait EntityStore: Send + Sync {
    fn create(
        &self,
        kind: Kind,
        parent: Option<&EntityKey>,
        local_key: Option<String>,
    ) -> Result<Entity, StoreError>;

    fn save(&self, entity: &Entity) -> Result<(), StoreError>;

    fn get(&self, key: &EntityKey) -> Result<Option<Entity>, StoreError>;

    /// All persisted entities of `kind` whose ancestor chain passes through
    /// `root`, in key order.
    fn children_of(&self, root: &EntityKey, kind: Kind) -> Result<Vec<Entity>, StoreError>;

    /// All persisted root-level entities of `kind`, in key order.
    fn roots(&self, kind: Kind) -> Result<Vec<Entity>, StoreError>;

    /// Removes `root` and every descendant. Returns the number of records
    /// deleted.
    fn delete_tree(&self, root: &EntityKey) -> Result<usize, StoreError>;
}

/// Reference store used by the worker and by tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: Mutex<BTreeMap<EntityKey, Entity>>,
    next_id: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entities: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn len(&self) -> usize {
        self.entities.lock().expect("store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn allocate_id(&self) -> KeyId {
        KeyId::Numeric(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

impl EntityStore for MemoryStore {
    fn create(
        &self,
        kind: Kind,
        parent: Option<&EntityKey>,
        local_key: Option<String>,
    ) -> Result<Entity, StoreError> {
        let id = match local_key {
            Some(name) => KeyId::Name(name),
            None => self.allocate_id(),
        };
        let key = match parent {
            Some(parent) => parent.child(kind, id),
            None => EntityKey::root(kind, id),
        };
        Ok(Entity::new(key))
    }

    fn save(&self, entity: &Entity) -> Result<(), StoreError> {
        self.entities
            .lock()
            .expect("store lock poisoned")
            .insert(entity.key.clone(), entity.clone());
        Ok(())
    }

    fn get(&self, key: &EntityKey) -> Result<Option<Entity>, StoreError> {
        Ok(self
            .entities
            .lock()
            .expect("store lock poisoned")
            .get(key)
            .cloned())
    }

    fn children_of(&self, root: &EntityKey, kind: Kind) -> Result<Vec<Entity>, StoreError> {
        Ok(self
            .entities
            .lock()
            .expect("store lock poisoned")
            .values()
            .filter(|e| e.kind() == kind && e.key.is_descendant_of(root))
            .cloned()
            .collect())
    }

    fn roots(&self, kind: Kind) -> Result<Vec<Entity>, StoreError> {
        Ok(self
            .entities
            .lock()
            .expect("store lock poisoned")
            .values()
            .filter(|e| e.kind() == kind && e.key.parent().is_none())
            .cloned()
            .collect())
    }

    fn delete_tree(&self, root: &EntityKey) -> Result<usize, StoreError> {
        let mut entities = self.entities.lock().expect("store lock poisoned");
        let doomed: Vec<EntityKey> = entities
            .keys()
            .filter(|k| *k == root || k.is_descendant_of(root))
            .cloned()
            .collect();
        for key in &doomed {
            entities.remove(key);
        }
        Ok(doomed.len())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Thin reqwest wrapper. Fetches are single-shot: any retry happens at the
/// job-queue level, one whole run at a time, never here.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    pub async fn get_json(
        &self,
        url: &str,
        query: &JsonMap<String, JsonValue>,
        bearer: Option<&str>,
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_get_json", url);
        let _guard = span.enter();

        let mut request = self.client.get(url).query(&query_pairs(query));
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.json().await?)
    }

    pub async fn post_json(
        &self,
        url: &str,
        query: &JsonMap<String, JsonValue>,
        body: &JsonValue,
        bearer: Option<&str>,
    ) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_post_json", url);
        let _guard = span.enter();

        let mut request = self.client.post(url).query(&query_pairs(query)).json(body);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.json().await?)
    }

    pub async fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let span = info_span!("http_get_bytes", url);
        let _guard = span.enter();

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: response.url().to_string(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

fn query_pairs(map: &JsonMap<String, JsonValue>) -> Vec<(String, String)> {
    map.iter()
        .map(|(k, v)| {
            let value = match v {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}
