//! Connected-agent registry and dispatch selection.
//!
//! The registry is the only mutable shared state between the WebSocket hub
//! and the dispatcher. It is mutated under a plain mutex; dispatch reads a
//! consistent snapshot inside the lock. Selection picks the least-loaded
//! capable agent, breaking ties by connection order with a rotating cursor
//! so equally-loaded agents share work round-robin.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::protocol::ServerFrame;
use crate::types::{AgentIdentity, TaskKind};

struct AgentEntry {
    identity: AgentIdentity,
    connected_at: DateTime<Utc>,
    /// Monotonic connection order, for deterministic tie-breaks.
    order: u64,
    tx: mpsc::Sender<ServerFrame>,
    in_flight: HashSet<String>,
}

/// Registry snapshot row for the observability endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AgentView {
    /// Agent id.
    pub agent_id: String,
    /// Worker hostname.
    pub hostname: String,
    /// Worker IP.
    pub ip: String,
    /// Worker build version.
    pub version: String,
    /// Supported task kinds.
    pub capabilities: Vec<TaskKind>,
    /// Sessions currently executing on this agent.
    pub in_flight: usize,
    /// Connection timestamp.
    pub connected_at: DateTime<Utc>,
}

struct RegistryInner {
    agents: HashMap<String, AgentEntry>,
    connect_counter: u64,
    rr_cursor: u64,
}

/// Connected-agent registry.
pub struct AgentRegistry {
    inner: Mutex<RegistryInner>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                agents: HashMap::new(),
                connect_counter: 0,
                rr_cursor: 0,
            }),
        }
    }

    /// Register a connected agent. An existing connection under the same
    /// id is replaced; its orphaned sessions are returned so the caller
    /// can fail them.
    pub fn register(&self, identity: AgentIdentity, tx: mpsc::Sender<ServerFrame>) -> Vec<String> {
        let mut inner = self.lock();
        inner.connect_counter = inner.connect_counter.saturating_add(1);
        let order = inner.connect_counter;
        let agent_id = identity.agent_id.clone();
        let previous = inner.agents.insert(
            agent_id.clone(),
            AgentEntry {
                identity,
                connected_at: Utc::now(),
                order,
                tx,
                in_flight: HashSet::new(),
            },
        );
        let orphaned: Vec<String> = previous
            .map(|entry| entry.in_flight.into_iter().collect())
            .unwrap_or_default();
        if !orphaned.is_empty() {
            warn!(agent_id, count = orphaned.len(), "replaced connection had tasks in flight");
        }
        info!(agent_id, "agent registered");
        orphaned
    }

    /// Remove an agent, returning the sessions it was running.
    pub fn unregister(&self, agent_id: &str) -> Vec<String> {
        let mut inner = self.lock();
        let orphaned = inner
            .agents
            .remove(agent_id)
            .map(|entry| entry.in_flight.into_iter().collect())
            .unwrap_or_default();
        info!(agent_id, "agent unregistered");
        orphaned
    }

    /// Pick an agent for a task kind: capability match, least in-flight,
    /// round-robin among equals.
    pub fn pick(&self, kind: TaskKind) -> Option<(String, mpsc::Sender<ServerFrame>)> {
        let mut inner = self.lock();
        inner.rr_cursor = inner.rr_cursor.saturating_add(1);
        let cursor = inner.rr_cursor;

        let mut candidates: Vec<(&String, &AgentEntry)> = inner
            .agents
            .iter()
            .filter(|(_, entry)| entry.identity.capabilities.contains(&kind))
            .collect();
        if candidates.is_empty() {
            return None;
        }

        let min_load = candidates
            .iter()
            .map(|(_, entry)| entry.in_flight.len())
            .min()
            .unwrap_or(0);
        candidates.retain(|(_, entry)| entry.in_flight.len() == min_load);
        candidates.sort_by_key(|(_, entry)| entry.order);

        let index = usize::try_from(cursor).unwrap_or(0) % candidates.len();
        let (agent_id, entry) = candidates[index];
        Some((agent_id.clone(), entry.tx.clone()))
    }

    /// Whether a pick for `kind` would currently succeed, without moving
    /// the round-robin cursor.
    pub fn pick_would_succeed(&self, kind: TaskKind) -> bool {
        let inner = self.lock();
        inner
            .agents
            .values()
            .any(|entry| entry.identity.capabilities.contains(&kind))
    }

    /// Record that a session is executing on an agent.
    pub fn assign(&self, agent_id: &str, session_id: &str) {
        let mut inner = self.lock();
        if let Some(entry) = inner.agents.get_mut(agent_id) {
            entry.in_flight.insert(session_id.to_owned());
        }
    }

    /// Drop a finished session from whichever agent holds it.
    pub fn release(&self, session_id: &str) {
        let mut inner = self.lock();
        for entry in inner.agents.values_mut() {
            entry.in_flight.remove(session_id);
        }
    }

    /// Sender for the agent currently running a session.
    pub fn agent_for_session(&self, session_id: &str) -> Option<(String, mpsc::Sender<ServerFrame>)> {
        let inner = self.lock();
        inner
            .agents
            .iter()
            .find(|(_, entry)| entry.in_flight.contains(session_id))
            .map(|(id, entry)| (id.clone(), entry.tx.clone()))
    }

    /// Total in-flight sessions across agents.
    pub fn total_in_flight(&self) -> usize {
        let inner = self.lock();
        inner
            .agents
            .values()
            .map(|entry| entry.in_flight.len())
            .sum()
    }

    /// Snapshot for the `/agents` endpoint.
    pub fn snapshot(&self) -> Vec<AgentView> {
        let inner = self.lock();
        let mut views: Vec<AgentView> = inner
            .agents
            .values()
            .map(|entry| AgentView {
                agent_id: entry.identity.agent_id.clone(),
                hostname: entry.identity.hostname.clone(),
                ip: entry.identity.ip.clone(),
                version: entry.identity.version.clone(),
                capabilities: entry.identity.capabilities.clone(),
                in_flight: entry.in_flight.len(),
                connected_at: entry.connected_at,
            })
            .collect();
        views.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        views
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryInner> {
        // A poisoned registry lock means a panic while holding it; the
        // registry state itself is still consistent (single-step inserts
        // and removes), so recover the guard.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
