//! Per-caller configuration and connection cache.

use crate::clock::SharedClock;
use crate::config::Configuration;
use crate::domain::DomainRouter;
use crate::errors::{GatewayError, GatewayResult};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

struct CallerEntry {
    config: Arc<Configuration>,
    /// Created on first `get`, dropped whenever the configuration changes backend
    connection: Option<Arc<DomainRouter>>,
}

/// Owns exactly one `DomainRouter` per caller id. Connections are never shared
/// between callers, even when they present identical credentials.
pub struct ConnectionFactory {
    entries: RwLock<HashMap<String, CallerEntry>>,
    clock: SharedClock,
}

impl ConnectionFactory {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Register or replace the configuration for `caller_id`.
    ///
    /// A configuration pointing at the same backend with the same credentials
    /// keeps the cached connection (only `debug` may differ). Anything else
    /// replaces the entry wholesale and the previous connection is returned so
    /// the caller can log it out.
    pub async fn configure(
        &self,
        caller_id: &str,
        config: Configuration,
    ) -> GatewayResult<Option<Arc<DomainRouter>>> {
        let mut entries = self.entries.write().await;

        if let Some(entry) = entries.get_mut(caller_id) {
            if entry.config.same_backend(&config) {
                if entry.config.debug != config.debug {
                    debug!(
                        "[ConnectionFactory] Debug for '{}' set to {}",
                        caller_id, config.debug
                    );
                }
                if let Some(connection) = &entry.connection {
                    connection.set_debug(config.debug);
                }
                entry.config = Arc::new(config);
                return Ok(None);
            }
        }

        info!(
            "[ConnectionFactory] Configuration for '{}' set: {} via {} ({})",
            caller_id,
            config.target.display_name(),
            config.credentials.method(),
            config.fingerprint()
        );

        let previous = entries.insert(
            caller_id.to_string(),
            CallerEntry {
                config: Arc::new(config),
                connection: None,
            },
        );
        Ok(previous.and_then(|entry| entry.connection))
    }

    /// Flip the debug flag of an already configured caller
    pub async fn set_debug(&self, caller_id: &str, enabled: bool) -> GatewayResult<()> {
        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(caller_id)
            .ok_or_else(|| GatewayError::UnknownCaller {
                caller_id: caller_id.to_string(),
            })?;

        let mut config = (*entry.config).clone();
        config.debug = enabled;
        entry.config = Arc::new(config);
        if let Some(connection) = &entry.connection {
            connection.set_debug(enabled);
        }
        Ok(())
    }

    pub async fn configuration(&self, caller_id: &str) -> Option<Arc<Configuration>> {
        self.entries
            .read()
            .await
            .get(caller_id)
            .map(|entry| Arc::clone(&entry.config))
    }

    /// Connection for `caller_id`, created on first use and memoized afterwards.
    /// The caller's current debug flag is applied on every access.
    pub async fn get(&self, caller_id: &str) -> GatewayResult<Arc<DomainRouter>> {
        {
            let entries = self.entries.read().await;
            let entry = entries
                .get(caller_id)
                .ok_or_else(|| GatewayError::UnknownCaller {
                    caller_id: caller_id.to_string(),
                })?;
            if let Some(connection) = &entry.connection {
                connection.set_debug(entry.config.debug);
                return Ok(Arc::clone(connection));
            }
        }

        let mut entries = self.entries.write().await;
        let entry = entries
            .get_mut(caller_id)
            .ok_or_else(|| GatewayError::UnknownCaller {
                caller_id: caller_id.to_string(),
            })?;

        // Another task may have created it while we waited for the write lock
        if let Some(connection) = &entry.connection {
            connection.set_debug(entry.config.debug);
            return Ok(Arc::clone(connection));
        }

        let connection = Arc::new(DomainRouter::from_configuration(
            &entry.config,
            Arc::clone(&self.clock),
        )?);
        info!(
            "[ConnectionFactory] Created connection for '{}' to {}",
            caller_id,
            entry.config.target.display_name()
        );
        entry.connection = Some(Arc::clone(&connection));
        Ok(connection)
    }

    /// Forget `caller_id` entirely. Returns its connection, if one was created.
    pub async fn evict(&self, caller_id: &str) -> Option<Arc<DomainRouter>> {
        let removed = self.entries.write().await.remove(caller_id)?;
        debug!("[ConnectionFactory] Evicted '{}'", caller_id);
        removed.connection
    }

    /// Forget every caller, returning the connections that were live
    pub async fn clear(&self) -> Vec<Arc<DomainRouter>> {
        self.entries
            .write()
            .await
            .drain()
            .filter_map(|(_, entry)| entry.connection)
            .collect()
    }

    pub async fn caller_ids(&self) -> Vec<String> {
        self.entries.read().await.keys().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    pub async fn contains(&self, caller_id: &str) -> bool {
        self.entries.read().await.contains_key(caller_id)
    }
}
