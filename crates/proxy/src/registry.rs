//! Registration store lookups and container lifecycle events.
//!
//! The proxy never decides which servers a container has: it asks a [`ServerRegistry`]
//! for a [`ServerLaunchSpec`] and listens on [`ContainerEvents`] for teardown.

use crate::error::{ProxyError, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// How to launch one stdio MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLaunchSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Overlaid on the proxy's own environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Read-only view of the registration store.
#[async_trait]
pub trait ServerRegistry: Send + Sync {
    async fn lookup(&self, container_id: &str, server_name: &str) -> Result<ServerLaunchSpec>;

    /// Whether the container is still known. Used to prune sessions when a teardown
    /// event may have been missed.
    async fn contains_container(&self, container_id: &str) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    Destroyed { container_id: String },
}

const CONTAINER_EVENT_BUFFER: usize = 64;

/// Broadcast bus for container lifecycle events.
#[derive(Clone)]
pub struct ContainerEvents {
    tx: broadcast::Sender<ContainerEvent>,
}

impl Default for ContainerEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerEvents {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CONTAINER_EVENT_BUFFER);
        Self { tx }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ContainerEvent> {
        self.tx.subscribe()
    }

    pub fn container_destroyed(&self, container_id: impl Into<String>) {
        let container_id = container_id.into();
        tracing::info!(container_id = %container_id, "container destroyed");
        // No subscribers just means nobody holds sessions yet.
        let _ = self.tx.send(ContainerEvent::Destroyed { container_id });
    }
}

pub type ContainerServers = HashMap<String, ServerLaunchSpec>;

/// In-memory registration store, loaded from the config file.
pub struct StaticRegistry {
    containers: RwLock<HashMap<String, ContainerServers>>,
    events: ContainerEvents,
}

impl StaticRegistry {
    #[must_use]
    pub fn new(containers: HashMap<String, ContainerServers>, events: ContainerEvents) -> Self {
        Self {
            containers: RwLock::new(containers),
            events,
        }
    }

    #[must_use]
    pub fn container_count(&self) -> usize {
        self.containers.read().len()
    }

    /// Replace the whole table. Containers that disappear are announced as destroyed.
    ///
    /// Returns the ids of the removed containers.
    pub fn replace_all(&self, containers: HashMap<String, ContainerServers>) -> Vec<String> {
        let removed: Vec<String> = {
            let mut guard = self.containers.write();
            let removed = guard
                .keys()
                .filter(|id| !containers.contains_key(*id))
                .cloned()
                .collect();
            *guard = containers;
            removed
        };
        for id in &removed {
            self.events.container_destroyed(id.clone());
        }
        removed
    }

    /// Remove one container and announce it. Returns `false` if it was unknown.
    pub fn remove_container(&self, container_id: &str) -> bool {
        let existed = self.containers.write().remove(container_id).is_some();
        if existed {
            self.events.container_destroyed(container_id);
        }
        existed
    }

    pub fn insert_server(&self, container_id: &str, server_name: &str, spec: ServerLaunchSpec) {
        self.containers
            .write()
            .entry(container_id.to_string())
            .or_default()
            .insert(server_name.to_string(), spec);
    }
}

#[async_trait]
impl ServerRegistry for StaticRegistry {
    async fn lookup(&self, container_id: &str, server_name: &str) -> Result<ServerLaunchSpec> {
        let guard = self.containers.read();
        let servers = guard
            .get(container_id)
            .ok_or_else(|| ProxyError::UnknownContainer(container_id.to_string()))?;
        servers
            .get(server_name)
            .cloned()
            .ok_or_else(|| ProxyError::UnknownServer {
                container_id: container_id.to_string(),
                server_name: server_name.to_string(),
            })
    }

    async fn contains_container(&self, container_id: &str) -> bool {
        self.containers.read().contains_key(container_id)
    }
}
