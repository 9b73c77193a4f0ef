//! Tenant/domain-aware routing on top of a primary `BackendSession`.

use crate::backend::{BackendSession, DomainKind};
use crate::clock::SharedClock;
use crate::config::Configuration;
use crate::errors::GatewayResult;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Objects requested per `show-gateways-and-servers` page
pub const DIRECTORY_PAGE_SIZE: usize = 500;

/// Domain holding the multi-domain server's own objects
const SYSTEM_DOMAIN: &str = "System Data";

/// Which session serves a resource
#[derive(Debug, Clone, PartialEq, Eq)]
enum ResourceRoute {
    Primary,
    Domain(String),
}

/// Per-caller connection: the primary session plus lazily created domain sessions
pub struct DomainRouter {
    primary: Arc<BackendSession>,
    /// domain name → secondary session
    domain_sessions: RwLock<HashMap<String, Arc<BackendSession>>>,
    /// resource name → route, so repeat calls skip the directory lookup
    resource_routes: RwLock<HashMap<String, ResourceRoute>>,
    debug: Arc<AtomicBool>,
}

impl DomainRouter {
    pub fn new(primary: BackendSession, debug: Arc<AtomicBool>) -> Self {
        Self {
            primary: Arc::new(primary),
            domain_sessions: RwLock::new(HashMap::new()),
            resource_routes: RwLock::new(HashMap::new()),
            debug,
        }
    }

    pub fn from_configuration(config: &Configuration, clock: SharedClock) -> GatewayResult<Self> {
        let debug = Arc::new(AtomicBool::new(config.debug));
        let primary = BackendSession::primary(config, Arc::clone(&debug), clock)?;
        Ok(Self::new(primary, debug))
    }

    pub fn primary(&self) -> &Arc<BackendSession> {
        &self.primary
    }

    /// Toggle payload logging for this connection and every session under it
    pub fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
    }

    pub fn debug(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub async fn is_multi_domain(&self) -> GatewayResult<bool> {
        Ok(self.primary.domain_kind().await? == DomainKind::MultiDomain)
    }

    /// Domains with a cached secondary session
    pub async fn cached_domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = self.domain_sessions.read().await.keys().cloned().collect();
        domains.sort();
        domains
    }

    /// Session that should serve calls about `target`. Without a target, or on a
    /// single-domain backend, this is the primary session.
    pub async fn resolve_connection(&self, target: Option<&str>) -> GatewayResult<Arc<BackendSession>> {
        let Some(resource) = target else {
            return Ok(Arc::clone(&self.primary));
        };

        if !self.is_multi_domain().await? {
            return Ok(Arc::clone(&self.primary));
        }

        let cached = self.resource_routes.read().await.get(resource).cloned();
        if let Some(route) = cached {
            return Ok(self.session_for(&route).await);
        }

        match self.lookup_route(resource).await? {
            Some(route) => {
                debug!("[DomainRouter] '{}' routed to {:?}", resource, route);
                self.resource_routes
                    .write()
                    .await
                    .insert(resource.to_string(), route.clone());
                Ok(self.session_for(&route).await)
            }
            None => {
                warn!(
                    "[DomainRouter] '{}' not found in the gateway directory, using the primary session",
                    resource
                );
                Ok(Arc::clone(&self.primary))
            }
        }
    }

    /// Execute `command` on the session that owns `target`
    pub async fn call(&self, command: &str, payload: &Value, target: Option<&str>) -> GatewayResult<Value> {
        let session = self.resolve_connection(target).await?;
        session.call(command, payload).await
    }

    /// Log out of every domain session, then the primary one. Failures are logged.
    pub async fn logout_all(&self) {
        let domains: Vec<Arc<BackendSession>> = self
            .domain_sessions
            .write()
            .await
            .drain()
            .map(|(_, session)| session)
            .collect();

        for session in domains {
            if let Err(e) = session.logout().await {
                warn!("[DomainRouter] Logout of {} failed: {}", session.name(), e);
            }
        }
        if let Err(e) = self.primary.logout().await {
            warn!("[DomainRouter] Logout of primary session failed: {}", e);
        }
        self.resource_routes.write().await.clear();
    }

    async fn session_for(&self, route: &ResourceRoute) -> Arc<BackendSession> {
        let domain = match route {
            ResourceRoute::Primary => return Arc::clone(&self.primary),
            ResourceRoute::Domain(domain) => domain,
        };

        if let Some(session) = self.domain_sessions.read().await.get(domain) {
            return Arc::clone(session);
        }

        let mut sessions = self.domain_sessions.write().await;
        let session = sessions.entry(domain.clone()).or_insert_with(|| {
            info!("[DomainRouter] Creating session for domain '{}'", domain);
            Arc::new(BackendSession::for_domain(Arc::clone(&self.primary), domain.clone()))
        });
        Arc::clone(session)
    }

    /// Find the domain owning `resource` in the gateway directory
    async fn lookup_route(&self, resource: &str) -> GatewayResult<Option<ResourceRoute>> {
        let mut offset = 0usize;

        loop {
            let page = self
                .primary
                .call(
                    "show-gateways-and-servers",
                    &json!({
                        "details-level": "full",
                        "limit": DIRECTORY_PAGE_SIZE,
                        "offset": offset,
                    }),
                )
                .await?;

            let objects = page
                .get("objects")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();

            if let Some(object) = objects
                .iter()
                .find(|object| object.get("name").and_then(Value::as_str) == Some(resource))
            {
                return Ok(Some(route_for(object)));
            }

            offset += objects.len();
            let total = page
                .get("total")
                .and_then(Value::as_u64)
                .unwrap_or(offset as u64);
            if objects.is_empty() || offset as u64 >= total {
                return Ok(None);
            }
        }
    }
}

fn route_for(object: &Value) -> ResourceRoute {
    let domain_name = object.pointer("/domain/name").and_then(Value::as_str);
    let domain_type = object.pointer("/domain/domain-type").and_then(Value::as_str);

    match (domain_name, domain_type) {
        (_, Some("mds")) | (None, _) => ResourceRoute::Primary,
        (Some(SYSTEM_DOMAIN), _) => ResourceRoute::Primary,
        (Some(name), _) => ResourceRoute::Domain(name.to_string()),
    }
}

impl std::fmt::Debug for DomainRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DomainRouter")
            .field("primary", &self.primary)
            .field("debug", &self.debug())
            .finish_non_exhaustive()
    }
}
