//! # Schema Metadata Cache
//!
//! Purpose: Resolve space and index names to the numeric ids the wire
//! protocol needs, refetching only when the server schema has moved on.
//!
//! ## Design Principles
//!
//! 1. **Version Stamped**: The cache remembers the schema version it was
//!    fetched at; every response updates a shared tracker, and a cache older
//!    than the tracker is refetched before the next read.
//! 2. **Single Flight**: Concurrent readers of a stale cache wait on one
//!    fetch instead of issuing their own.
//! 3. **Bounded Misses**: A name that is not in a fresh cache triggers one
//!    refetch, then a definitive `NoSchema` error.
//! 4. **Immutable Snapshots**: Readers clone an `Arc` of the cache; a
//!    refetch swaps in a new one.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use iproto_common::{
    RequestTarget, SelectParams, ER_NO_SUCH_INDEX, ER_NO_SUCH_SPACE, ER_WRONG_SCHEMA_VERSION,
    VINDEX_ID, VSPACE_ID,
};
use parking_lot::RwLock;
use rmpv::Value;
use tracing::debug;

use crate::balancer::Balancer;
use crate::config::SchemaVersionPolicy;
use crate::error::{ClientError, ClientResult};
use crate::waiter::{RequestOptions, Response};

/// Highest schema version seen on any response of the pool.
#[derive(Debug, Default)]
pub struct SchemaVersionTracker {
    observed: AtomicU64,
}

impl SchemaVersionTracker {
    pub fn new() -> Self {
        SchemaVersionTracker::default()
    }

    /// Records a version; older values never move the tracker back.
    pub fn observe(&self, version: u64) {
        self.observed.fetch_max(version, Ordering::AcqRel);
    }

    pub fn current(&self) -> u64 {
        self.observed.load(Ordering::Acquire)
    }
}

/// One field of a space format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub field_type: String,
}

/// Index metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Index {
    pub id: u32,
    pub space_id: u32,
    pub name: String,
    pub index_type: String,
}

/// Space metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Space {
    pub id: u32,
    pub name: String,
    pub engine: String,
    pub format: Vec<Field>,
    pub indexes: Vec<Index>,
}

impl Space {
    pub fn index_by_name(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|index| index.name == name)
    }

    pub fn index_by_id(&self, id: u32) -> Option<&Index> {
        self.indexes.iter().find(|index| index.id == id)
    }

    /// Position of a named field in the tuple.
    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.format.iter().position(|field| field.name == name)
    }
}

/// One fetched snapshot of the schema.
#[derive(Debug, Default)]
pub struct SchemaCache {
    /// Increments on every install; 0 means never fetched.
    generation: u64,
    version: u64,
    spaces: HashMap<u32, Arc<Space>>,
    names: HashMap<String, u32>,
}

impl SchemaCache {
    /// Builds a cache from `_vspace` and `_vindex` rows.
    pub fn from_rows(version: u64, space_rows: &[Value], index_rows: &[Value]) -> Self {
        let mut spaces: HashMap<u32, Space> = space_rows.iter().filter_map(parse_space).map(|s| (s.id, s)).collect();
        for index in index_rows.iter().filter_map(parse_index) {
            if let Some(space) = spaces.get_mut(&index.space_id) {
                space.indexes.push(index);
            }
        }
        for space in spaces.values_mut() {
            space.indexes.sort_by_key(|index| index.id);
        }
        let names = spaces.values().map(|s| (s.name.clone(), s.id)).collect();
        SchemaCache {
            generation: 0,
            version,
            spaces: spaces.into_iter().map(|(id, s)| (id, Arc::new(s))).collect(),
            names,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    pub fn space(&self, target: &RequestTarget) -> Option<Arc<Space>> {
        let id = match target {
            RequestTarget::ById(id) => *id,
            RequestTarget::ByName(name) => *self.names.get(name)?,
        };
        self.spaces.get(&id).cloned()
    }
}

fn parse_space(row: &Value) -> Option<Space> {
    let fields = row.as_array()?;
    let id = fields.first()?.as_u64()? as u32;
    let name = fields.get(2)?.as_str()?.to_string();
    let engine = fields.get(3).and_then(Value::as_str).unwrap_or_default().to_string();
    let format = fields
        .get(6)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(parse_field).collect())
        .unwrap_or_default();
    Some(Space {
        id,
        name,
        engine,
        format,
        indexes: Vec::new(),
    })
}

fn parse_field(item: &Value) -> Option<Field> {
    let map = item.as_map()?;
    let lookup = |key: &str| {
        map.iter()
            .find(|(k, _)| k.as_str() == Some(key))
            .and_then(|(_, v)| v.as_str())
            .map(str::to_string)
    };
    Some(Field {
        name: lookup("name")?,
        field_type: lookup("type").unwrap_or_else(|| "any".to_string()),
    })
}

fn parse_index(row: &Value) -> Option<Index> {
    let fields = row.as_array()?;
    Some(Index {
        space_id: fields.first()?.as_u64()? as u32,
        id: fields.get(1)?.as_u64()? as u32,
        name: fields.get(2)?.as_str()?.to_string(),
        index_type: fields.get(3).and_then(Value::as_str).unwrap_or_default().to_string(),
    })
}

/// Numeric ids a request resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub space_id: u32,
    pub index_id: u32,
    /// Schema version the ids are valid for.
    pub schema_version: u64,
}

struct Lookup {
    space: Arc<Space>,
    cache: Arc<SchemaCache>,
    /// The cache was refetched during this lookup.
    refreshed: bool,
}

/// Version-checked schema cache backed by the pool.
pub struct SchemaFetcher {
    balancer: Arc<Balancer>,
    tracker: Arc<SchemaVersionTracker>,
    policy: SchemaVersionPolicy,
    cache: RwLock<Arc<SchemaCache>>,
    refetch: tokio::sync::Mutex<()>,
    stale: AtomicBool,
    fetches: AtomicU64,
}

impl SchemaFetcher {
    pub fn new(balancer: Arc<Balancer>, tracker: Arc<SchemaVersionTracker>, policy: SchemaVersionPolicy) -> Self {
        SchemaFetcher {
            balancer,
            tracker,
            policy,
            cache: RwLock::new(Arc::new(SchemaCache::default())),
            refetch: tokio::sync::Mutex::new(()),
            stale: AtomicBool::new(false),
            fetches: AtomicU64::new(0),
        }
    }

    /// Number of completed fetches.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Acquire)
    }

    /// Version of the cached snapshot (0 before the first fetch).
    pub fn cached_version(&self) -> u64 {
        self.cache.read().version
    }

    /// Forces a refetch before the next read.
    pub fn invalidate(&self) {
        self.stale.store(true, Ordering::Release);
    }

    fn is_fresh(&self, cache: &SchemaCache) -> bool {
        cache.generation > 0 && !self.stale.load(Ordering::Acquire) && cache.version >= self.tracker.current()
    }

    fn snapshot(&self) -> Arc<SchemaCache> {
        self.cache.read().clone()
    }

    /// Returns the space, refetching when the cache is stale or the name is
    /// unknown (once).
    pub async fn get(&self, space: &RequestTarget) -> ClientResult<Arc<Space>> {
        let lookup = self.get_with_cache(space).await?;
        Ok(lookup.space)
    }

    async fn get_with_cache(&self, target: &RequestTarget) -> ClientResult<Lookup> {
        let mut cache = self.snapshot();
        let refreshed = !self.is_fresh(&cache);
        if refreshed {
            cache = self.refresh(cache.generation).await?;
        }
        if let Some(space) = cache.space(target) {
            return Ok(Lookup {
                space,
                cache,
                refreshed,
            });
        }
        // A refetch already happened on this lookup; a miss now is final.
        if refreshed {
            return Err(ClientError::NoSchema(format!("no such space '{}'", target)));
        }
        let refetched = self.refresh_forced(cache.generation).await?;
        match refetched.space(target) {
            Some(space) => Ok(Lookup {
                space,
                cache: refetched,
                refreshed: true,
            }),
            None => Err(ClientError::NoSchema(format!("no such space '{}'", target))),
        }
    }

    /// Resolves a space and an optional index to numeric ids.
    pub async fn resolve(&self, space: &RequestTarget, index: Option<&RequestTarget>) -> ClientResult<ResolvedTarget> {
        let index = index.cloned().unwrap_or_default();
        if let (RequestTarget::ById(space_id), RequestTarget::ById(index_id)) = (space, &index) {
            return Ok(ResolvedTarget {
                space_id: *space_id,
                index_id: *index_id,
                schema_version: 0,
            });
        }

        let Lookup {
            space: found,
            cache,
            refreshed,
        } = self.get_with_cache(space).await?;
        let name = match &index {
            RequestTarget::ById(id) => {
                return Ok(ResolvedTarget {
                    space_id: found.id,
                    index_id: *id,
                    schema_version: cache.version,
                })
            }
            RequestTarget::ByName(name) => name,
        };
        if let Some(idx) = found.index_by_name(name) {
            return Ok(ResolvedTarget {
                space_id: found.id,
                index_id: idx.id,
                schema_version: cache.version,
            });
        }

        let no_index = || ClientError::NoSchema(format!("no such index '{}' in space '{}'", name, found.name));
        if refreshed {
            return Err(no_index());
        }
        let refetched = self.refresh_forced(cache.generation).await?;
        let idx = refetched
            .space(&RequestTarget::ById(found.id))
            .and_then(|s| s.index_by_name(name).map(|i| i.id));
        match idx {
            Some(index_id) => Ok(ResolvedTarget {
                space_id: found.id,
                index_id,
                schema_version: refetched.version,
            }),
            None => Err(no_index()),
        }
    }

    /// Refetches unless someone else refreshed since `seen` and the result
    /// is fresh.
    async fn refresh(&self, seen: u64) -> ClientResult<Arc<SchemaCache>> {
        let _guard = self.refetch.lock().await;
        let current = self.snapshot();
        if current.generation != seen && self.is_fresh(&current) {
            return Ok(current);
        }
        self.fetch_locked(current.generation).await
    }

    /// Refetches unless someone else already refetched since `seen`.
    async fn refresh_forced(&self, seen: u64) -> ClientResult<Arc<SchemaCache>> {
        let _guard = self.refetch.lock().await;
        let current = self.snapshot();
        if current.generation != seen {
            return Ok(current);
        }
        self.fetch_locked(current.generation).await
    }

    async fn fetch_locked(&self, previous_generation: u64) -> ClientResult<Arc<SchemaCache>> {
        self.stale.store(false, Ordering::Release);
        let fetched = self.fetch_rows(previous_generation).await;
        if fetched.is_err() {
            self.stale.store(true, Ordering::Release);
        }
        fetched
    }

    async fn fetch_rows(&self, previous_generation: u64) -> ClientResult<Arc<SchemaCache>> {
        let conn = self.balancer.get_next().await?;
        let all = SelectParams::all();
        let spaces = conn
            .select(&VSPACE_ID.into(), &RequestTarget::ById(0), Vec::new(), all, RequestOptions::new())?
            .await?;
        let indexes = conn
            .select(&VINDEX_ID.into(), &RequestTarget::ById(0), Vec::new(), all, RequestOptions::new())?
            .await?;

        let version = spaces
            .schema_version
            .unwrap_or(0)
            .max(indexes.schema_version.unwrap_or(0));
        self.tracker.observe(version);

        let mut cache = SchemaCache::from_rows(version, &spaces.into_data(), &indexes.into_data());
        cache.generation = previous_generation + 1;
        let cache = Arc::new(cache);
        *self.cache.write() = cache.clone();
        self.fetches.fetch_add(1, Ordering::AcqRel);
        debug!(version, spaces = cache.len(), generation = cache.generation, "schema fetched");
        Ok(cache)
    }

    /// Runs a request built from cached metadata, reacting to schema errors.
    ///
    /// **Logic**:
    /// 1. Send the request.
    /// 2. "No such space/index" marks the cache stale and is surfaced.
    /// 3. "Wrong schema version" marks the cache stale; under `Ignore` the
    ///    request is rebuilt and sent once more, under `Strict` it fails with
    ///    `SchemaVersionMismatch`.
    /// 4. Under `Strict`, a response stamped older than the cache fails.
    pub async fn process_request<F, Fut>(&self, mut send: F) -> ClientResult<Response>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ClientResult<Response>>,
    {
        match send().await {
            Err(ClientError::Server { code, message }) if code == ER_WRONG_SCHEMA_VERSION => {
                let cached = self.cached_version();
                self.invalidate();
                match self.policy {
                    SchemaVersionPolicy::Strict => Err(ClientError::SchemaVersionMismatch {
                        cached,
                        received: self.tracker.current(),
                    }),
                    SchemaVersionPolicy::Ignore => {
                        debug!(cached, %message, "schema changed under request, retrying");
                        let retried = send().await;
                        self.check(retried)
                    }
                }
            }
            result => self.check(result),
        }
    }

    fn check(&self, result: ClientResult<Response>) -> ClientResult<Response> {
        match result {
            Err(ClientError::Server { code, message }) => {
                if code == ER_NO_SUCH_SPACE || code == ER_NO_SUCH_INDEX || code == ER_WRONG_SCHEMA_VERSION {
                    self.invalidate();
                }
                Err(ClientError::Server { code, message })
            }
            Ok(response) => {
                if self.policy == SchemaVersionPolicy::Strict {
                    let cached = self.cached_version();
                    if let Some(received) = response.schema_version {
                        if received < cached {
                            return Err(ClientError::SchemaVersionMismatch { cached, received });
                        }
                    }
                }
                Ok(response)
            }
            Err(err) => Err(err),
        }
    }
}
