//! Connection registry
//!
//! Maps an opaque connection id to a live [`ProtocolClient`]. Two namespaces
//! share the id space:
//!
//! - `proxy_<configId>` resolves to a proxy session bridged for `configId`
//! - anything else resolves to a directly-held client
//!
//! When several live sessions share a `configId`, the most recently registered
//! one wins. Removing it falls back to the next most recent.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::mcp_client::ProtocolClient;
use super::session::ProxySession;
use crate::error::GatewayError;

/// Literal prefix marking proxy connection ids
pub const PROXY_PREFIX: &str = "proxy_";

/// Whether `id` names a proxy connection (pure prefix check)
pub fn is_proxy_connection(id: &str) -> bool {
    id.starts_with(PROXY_PREFIX)
}

/// Proxy connection id for a config id
pub fn proxy_connection_id(config_id: &str) -> String {
    format!("{}{}", PROXY_PREFIX, config_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionKind {
    Direct,
    Proxied,
}

/// A resolved connection
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub kind: ConnectionKind,
    pub client: Arc<dyn ProtocolClient>,
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryState {
    direct: HashMap<String, ConnectionHandle>,
    sessions: HashMap<String, Arc<ProxySession>>,
    /// configId -> session ids, oldest first
    by_config: HashMap<String, Vec<String>>,
}

/// Process-wide connection table, cheap to clone
///
/// Locks are never held across an `.await`, so a plain `std` lock is enough and
/// lets the session drop guard clean up synchronously.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a direct client under `id`, replacing any previous one.
    ///
    /// The replaced handle is returned so the caller can close it.
    pub fn register_direct(&self, id: impl Into<String>, client: Arc<dyn ProtocolClient>) -> Option<ConnectionHandle> {
        let id = id.into();
        let handle = ConnectionHandle {
            id: id.clone(),
            kind: ConnectionKind::Direct,
            client,
        };
        let previous = self.write().direct.insert(id.clone(), handle);
        tracing::info!(connection_id = %id, replaced = previous.is_some(), "Direct connection registered");
        previous
    }

    /// Resolve `id` to a live handle
    pub fn get_client(&self, id: &str) -> Result<ConnectionHandle, GatewayError> {
        if let Some(config_id) = id.strip_prefix(PROXY_PREFIX) {
            return self
                .latest_live_session(config_id)
                .map(|session| ConnectionHandle {
                    id: id.to_string(),
                    kind: ConnectionKind::Proxied,
                    client: session.client.clone(),
                })
                .ok_or_else(|| GatewayError::ConnectionNotFound(id.to_string()));
        }

        let handle = self.read().direct.get(id).cloned();
        match handle {
            Some(h) if h.client.is_live() => Ok(h),
            Some(dead) => self
                .evict_dead(id, &dead)
                .ok_or_else(|| GatewayError::ConnectionNotFound(id.to_string())),
            None => Err(GatewayError::ConnectionNotFound(id.to_string())),
        }
    }

    /// Remove `dead` from `id` unless it was replaced since it was read.
    ///
    /// Returns the live replacement, if one was registered in between.
    fn evict_dead(&self, id: &str, dead: &ConnectionHandle) -> Option<ConnectionHandle> {
        let mut state = self.write();
        let current = state.direct.get(id)?;
        if !Arc::ptr_eq(&current.client, &dead.client) {
            return Some(current.clone()).filter(|h| h.client.is_live());
        }
        state.direct.remove(id);
        drop(state);
        tracing::warn!(connection_id = %id, "Dropped dead direct connection");
        None
    }

    fn latest_live_session(&self, config_id: &str) -> Option<Arc<ProxySession>> {
        let state = self.read();
        state
            .by_config
            .get(config_id)?
            .iter()
            .rev()
            .filter_map(|sid| state.sessions.get(sid))
            .find(|s| s.client.is_live())
            .cloned()
    }

    /// Tear down and forget a direct connection.
    ///
    /// Unknown ids succeed silently. Proxy ids are only acknowledged; their
    /// lifetime belongs to the stream that opened them.
    pub async fn disconnect_direct(&self, id: &str) -> bool {
        if is_proxy_connection(id) {
            tracing::debug!(connection_id = %id, "Disconnect of proxy id acknowledged");
            return false;
        }
        let removed = self.write().direct.remove(id);
        match removed {
            Some(handle) => {
                handle.client.close().await;
                tracing::info!(connection_id = %id, "Direct connection closed");
                true
            }
            None => false,
        }
    }

    pub fn register_proxy_session(&self, session: Arc<ProxySession>) {
        let mut state = self.write();
        state
            .by_config
            .entry(session.config_id.clone())
            .or_default()
            .push(session.session_id.clone());
        tracing::info!(
            session_id = %session.session_id,
            config_id = %session.config_id,
            sessions_for_config = state.by_config[&session.config_id].len(),
            "Proxy session registered"
        );
        state.sessions.insert(session.session_id.clone(), session);
    }

    /// Forget a session and fail its in-flight calls. Idempotent.
    pub fn remove_proxy_session(&self, session_id: &str) -> Option<Arc<ProxySession>> {
        let removed = {
            let mut state = self.write();
            let session = state.sessions.remove(session_id)?;
            if let Some(ids) = state.by_config.get_mut(&session.config_id) {
                ids.retain(|sid| sid != session_id);
                if ids.is_empty() {
                    state.by_config.remove(&session.config_id);
                }
            }
            session
        };
        removed.client.shutdown();
        Some(removed)
    }

    pub fn proxy_session(&self, session_id: &str) -> Option<Arc<ProxySession>> {
        self.read().sessions.get(session_id).cloned()
    }

    /// Config ids with at least one live session, sorted and deduplicated
    pub fn list_active_config_ids(&self) -> Vec<String> {
        let state = self.read();
        state
            .sessions
            .values()
            .filter(|s| s.client.is_live())
            .map(|s| s.config_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Every resolvable connection id: direct ids plus `proxy_<configId>`
    pub fn list_connection_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().direct.keys().cloned().collect();
        ids.sort();
        ids.extend(self.list_active_config_ids().iter().map(|c| proxy_connection_id(c)));
        ids
    }

    pub fn has_direct(&self, id: &str) -> bool {
        self.read().direct.contains_key(id)
    }

    pub fn direct_count(&self) -> usize {
        self.read().direct.len()
    }

    pub fn session_count(&self) -> usize {
        self.read().sessions.len()
    }

    /// Close every direct client (shutdown path)
    pub async fn close_all(&self) {
        let handles: Vec<ConnectionHandle> = self.write().direct.drain().map(|(_, h)| h).collect();
        for handle in handles {
            handle.client.close().await;
        }
    }
}
