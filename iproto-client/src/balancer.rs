//! # Connection Balancer
//!
//! Purpose: Pick the next Ready connection for a request according to a
//! named policy.
//!
//! ## Design Principles
//! 1. **Ready Only**: Policies see every live connection but may only return
//!    one whose `is_ready()` holds; Degraded, draining, and Closed
//!    connections are skipped.
//! 2. **Lowest Index Wins Ties**: Candidates arrive in slot order (group
//!    order, then index), so scanning forward breaks ties toward index 0.
//! 3. **Registry Construction**: Policies are built by name through a
//!    table of constructors; unknown names are a configuration error.
//! 4. **Wait, Bounded**: With nothing Ready, `get_next` parks on the pool's
//!    ready signal until the connect timeout elapses.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::pool::ConnectionPool;

pub const ROUND_ROBIN: &str = "round_robin";
pub const TAG_ROUND_ROBIN: &str = "tag_round_robin";
pub const DISTRIBUTING: &str = "distributing";

/// Selection strategy over the pool's live connections.
pub trait BalancerPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Chooses one Ready connection from `candidates` (slot order).
    fn select(&self, candidates: &[Connection]) -> Option<Connection>;
}

/// Builds a policy from configuration.
pub type PolicyConstructor = fn(&ClientConfig) -> ClientResult<Box<dyn BalancerPolicy>>;

/// Name → constructor table for balancer policies.
pub struct PolicyRegistry {
    constructors: HashMap<&'static str, PolicyConstructor>,
}

impl Default for PolicyRegistry {
    fn default() -> Self {
        let mut registry = PolicyRegistry {
            constructors: HashMap::new(),
        };
        registry.register(ROUND_ROBIN, |_| Ok(Box::new(RoundRobin::new())));
        registry.register(TAG_ROUND_ROBIN, |config| {
            let tag = config
                .balancer_tag
                .clone()
                .or_else(|| config.groups.first().map(|group| group.tag.clone()))
                .ok_or_else(|| ClientError::Config("tag round robin needs a tag".into()))?;
            Ok(Box::new(TagRoundRobin::new(tag)))
        });
        registry.register(DISTRIBUTING, |_| Ok(Box::new(Distributing::new())));
        registry
    }
}

impl PolicyRegistry {
    pub fn new() -> Self {
        PolicyRegistry::default()
    }

    /// Adds or replaces a policy constructor.
    pub fn register(&mut self, name: &'static str, constructor: PolicyConstructor) {
        self.constructors.insert(name, constructor);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Builds the policy `config.balancer` names.
    pub fn build(&self, config: &ClientConfig) -> ClientResult<Box<dyn BalancerPolicy>> {
        let constructor = self
            .constructors
            .get(config.balancer.as_str())
            .ok_or_else(|| ClientError::Config(format!("unknown balancer '{}'", config.balancer)))?;
        constructor(config)
    }
}

/// Cursor-based round robin over ready connections.
fn next_ready(cursor: &mut usize, candidates: &[Connection]) -> Option<Connection> {
    let len = candidates.len();
    for offset in 0..len {
        let pos = (*cursor + offset) % len;
        if candidates[pos].is_ready() {
            *cursor = pos + 1;
            return Some(candidates[pos].clone());
        }
    }
    None
}

/// Round robin across every tag.
#[derive(Default)]
pub struct RoundRobin {
    cursor: Mutex<usize>,
}

impl RoundRobin {
    pub fn new() -> Self {
        RoundRobin::default()
    }
}

impl BalancerPolicy for RoundRobin {
    fn name(&self) -> &'static str {
        ROUND_ROBIN
    }

    fn select(&self, candidates: &[Connection]) -> Option<Connection> {
        let mut cursor = self.cursor.lock();
        next_ready(&mut cursor, candidates)
    }
}

/// Round robin restricted to one tag.
pub struct TagRoundRobin {
    tag: String,
    cursor: Mutex<usize>,
}

impl TagRoundRobin {
    pub fn new(tag: impl Into<String>) -> Self {
        TagRoundRobin {
            tag: tag.into(),
            cursor: Mutex::new(0),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }
}

impl BalancerPolicy for TagRoundRobin {
    fn name(&self) -> &'static str {
        TAG_ROUND_ROBIN
    }

    fn select(&self, candidates: &[Connection]) -> Option<Connection> {
        let scoped: Vec<Connection> = candidates
            .iter()
            .filter(|conn| conn.tag() == self.tag)
            .cloned()
            .collect();
        let mut cursor = self.cursor.lock();
        next_ready(&mut cursor, &scoped)
    }
}

#[derive(Default)]
struct TagWeight {
    current: i64,
    cursor: usize,
}

/// Smooth weighted round robin across tags, each tag weighted by its number
/// of Ready connections; round robin inside the chosen tag.
#[derive(Default)]
pub struct Distributing {
    state: Mutex<HashMap<String, TagWeight>>,
}

impl Distributing {
    pub fn new() -> Self {
        Distributing::default()
    }
}

impl BalancerPolicy for Distributing {
    fn name(&self) -> &'static str {
        DISTRIBUTING
    }

    fn select(&self, candidates: &[Connection]) -> Option<Connection> {
        // Tags in first-seen order with their ready connections.
        let mut tags: Vec<(&str, Vec<&Connection>)> = Vec::new();
        for conn in candidates.iter().filter(|conn| conn.is_ready()) {
            match tags.iter().position(|(tag, _)| *tag == conn.tag()) {
                Some(pos) => tags[pos].1.push(conn),
                None => tags.push((conn.tag(), vec![conn])),
            }
        }
        if tags.is_empty() {
            return None;
        }

        let mut state = self.state.lock();
        let total: i64 = tags.iter().map(|(_, conns)| conns.len() as i64).sum();
        let mut best: Option<(usize, i64)> = None;
        for (pos, (tag, conns)) in tags.iter().enumerate() {
            let weight = state.entry(tag.to_string()).or_default();
            weight.current += conns.len() as i64;
            let current = weight.current;
            if best.map_or(true, |(_, top)| current > top) {
                best = Some((pos, current));
            }
        }

        let (best, _) = best?;
        let (tag, conns) = &tags[best];
        let weight = state.entry(tag.to_string()).or_default();
        weight.current -= total;
        let pos = weight.cursor % conns.len();
        weight.cursor = pos + 1;
        Some(conns[pos].clone())
    }
}

/// Policy plus the pool it selects from.
pub struct Balancer {
    pool: ConnectionPool,
    policy: Box<dyn BalancerPolicy>,
    wait: Duration,
}

impl Balancer {
    /// `wait` bounds how long `get_next` parks when nothing is Ready.
    pub fn new(pool: ConnectionPool, policy: Box<dyn BalancerPolicy>, wait: Duration) -> Self {
        Balancer { pool, policy, wait }
    }

    pub fn from_config(pool: ConnectionPool, config: &ClientConfig) -> ClientResult<Self> {
        let policy = PolicyRegistry::default().build(config)?;
        Ok(Balancer::new(pool, policy, config.connect_timeout()))
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Selects a Ready connection now, if any.
    pub fn try_next(&self) -> ClientResult<Option<Connection>> {
        let candidates = self.pool.connections(None)?;
        Ok(self.policy.select(&candidates))
    }

    /// Selects a Ready connection, waiting for one up to the connect timeout.
    pub async fn get_next(&self) -> ClientResult<Connection> {
        let started = Instant::now();
        loop {
            let notified = self.pool.ready_notify().notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(conn) = self.try_next()? {
                trace!(tag = %conn.tag(), index = conn.index(), policy = self.policy.name(), "connection selected");
                return Ok(conn);
            }

            let remaining = self.wait.saturating_sub(started.elapsed());
            if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
                if self.pool.is_closed() {
                    return Err(ClientError::PoolClosed);
                }
                return Err(ClientError::NoAvailableConnection {
                    waited: started.elapsed(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionContext, ConnectionState};
    use crate::group::InstanceConnectionGroup;
    use tokio::io::{duplex, DuplexStream};
    use tokio::runtime::Handle;

    fn ready(tag: &str, index: usize, keep: &mut Vec<DuplexStream>) -> Connection {
        let (client, server) = duplex(1024);
        keep.push(server);
        let conn = Connection::spawn(client, tag, index, vec![0; 20], ConnectionContext::new(Handle::current()));
        conn.set_state(ConnectionState::Ready);
        conn
    }

    fn picks(policy: &dyn BalancerPolicy, candidates: &[Connection], n: usize) -> Vec<(String, usize)> {
        (0..n)
            .map(|_| {
                let conn = policy.select(candidates).unwrap();
                (conn.tag().to_string(), conn.index())
            })
            .collect()
    }

    #[tokio::test]
    async fn round_robin_starts_at_lowest_index() {
        let mut keep = Vec::new();
        let conns = vec![ready("default", 0, &mut keep), ready("default", 1, &mut keep)];
        let order: Vec<usize> = picks(&RoundRobin::new(), &conns, 3).into_iter().map(|(_, i)| i).collect();
        assert_eq!(order, vec![0, 1, 0]);
    }

    #[tokio::test]
    async fn round_robin_skips_degraded_and_closed() {
        let mut keep = Vec::new();
        let conns = vec![
            ready("a", 0, &mut keep),
            ready("a", 1, &mut keep),
            ready("a", 2, &mut keep),
        ];
        conns[0].set_state(ConnectionState::Degraded);
        conns[2].abort();
        let order: Vec<usize> = picks(&RoundRobin::new(), &conns, 3).into_iter().map(|(_, i)| i).collect();
        assert_eq!(order, vec![1, 1, 1]);

        conns[1].set_state(ConnectionState::Degraded);
        assert!(RoundRobin::new().select(&conns).is_none());
    }

    #[tokio::test]
    async fn tag_round_robin_stays_in_tag() {
        let mut keep = Vec::new();
        let conns = vec![
            ready("a", 0, &mut keep),
            ready("b", 0, &mut keep),
            ready("b", 1, &mut keep),
        ];
        let picked = picks(&TagRoundRobin::new("b"), &conns, 3);
        assert_eq!(
            picked,
            vec![("b".into(), 0), ("b".into(), 1), ("b".into(), 0)]
        );
    }

    #[tokio::test]
    async fn distributing_follows_ready_counts() {
        let mut keep = Vec::new();
        let conns = vec![
            ready("a", 0, &mut keep),
            ready("a", 1, &mut keep),
            ready("a", 2, &mut keep),
            ready("b", 0, &mut keep),
        ];
        let picked = picks(&Distributing::new(), &conns, 8);
        let to_a = picked.iter().filter(|(tag, _)| tag == "a").count();
        assert_eq!(to_a, 6);
        assert_eq!(picked.len() - to_a, 2);
        assert_eq!(picked[0], ("a".into(), 0));
    }

    #[test]
    fn registry_rejects_unknown_names() {
        let config = ClientConfig::new(InstanceConnectionGroup::new("a", "h", 1)).with_balancer("random");
        assert!(matches!(PolicyRegistry::new().build(&config), Err(ClientError::Config(_))));

        let config = config.with_balancer(TAG_ROUND_ROBIN);
        let policy = PolicyRegistry::new().build(&config).unwrap();
        assert_eq!(policy.name(), TAG_ROUND_ROBIN);
    }
}
