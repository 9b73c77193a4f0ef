use crate::clock::SharedClock;
use crate::errors::{GatewayError, GatewayResult};
use crate::session::{CallerSession, TransportMetadata};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_MAX_SESSIONS: usize = 100;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Per-caller entry in the status report. Never carries credentials.
#[derive(Debug, Clone, Serialize)]
pub struct CallerStatus {
    pub caller_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub transport: TransportMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub active_callers: usize,
    pub callers: Vec<CallerStatus>,
}

/// Caller lifecycle bookkeeping: creation, activity and eviction
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, CallerSession>>>,
    max_sessions: usize,
    clock: SharedClock,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, clock: SharedClock) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            max_sessions,
            clock,
        }
    }

    /// Record contact from `caller_id`, creating the session on first contact.
    /// Returns the callers evicted because the population cap was exceeded.
    pub fn touch(&self, caller_id: &str, metadata: TransportMetadata) -> GatewayResult<Vec<String>> {
        let now = self.clock.utc();
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| GatewayError::internal(format!("Failed to acquire write lock: {e}")))?;

        match sessions.get_mut(caller_id) {
            Some(session) => {
                session.touch(now);
                session.metadata = metadata;
                Ok(Vec::new())
            }
            None => {
                info!("[SessionRegistry] New caller session: {}", caller_id);
                sessions.insert(
                    caller_id.to_string(),
                    CallerSession::new(caller_id, metadata, now),
                );
                Ok(Self::enforce_cap(&mut sessions, caller_id, self.max_sessions))
            }
        }
    }

    /// Get session by caller id
    pub fn get(&self, caller_id: &str) -> GatewayResult<Option<CallerSession>> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| GatewayError::internal(format!("Failed to acquire read lock: {e}")))?;
        Ok(sessions.get(caller_id).cloned())
    }

    /// Explicit teardown
    pub fn remove(&self, caller_id: &str) -> GatewayResult<bool> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| GatewayError::internal(format!("Failed to acquire write lock: {e}")))?;
        Ok(sessions.remove(caller_id).is_some())
    }

    /// Remove every non-default caller idle for longer than `timeout`
    pub fn evict_idle(&self, timeout: Duration) -> GatewayResult<Vec<String>> {
        let now = self.clock.utc();
        let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(36_500));
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| GatewayError::internal(format!("Failed to acquire write lock: {e}")))?;

        let stale: Vec<String> = sessions
            .values()
            .filter(|session| !session.is_default() && session.idle_for(now) > timeout)
            .map(|session| session.caller_id.clone())
            .collect();

        for caller_id in &stale {
            sessions.remove(caller_id);
        }
        if !stale.is_empty() {
            info!("[SessionRegistry] Evicted {} idle caller(s)", stale.len());
        }
        Ok(stale)
    }

    /// Get session count
    pub fn session_count(&self) -> GatewayResult<usize> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| GatewayError::internal(format!("Failed to acquire read lock: {e}")))?;
        Ok(sessions.len())
    }

    pub fn status_report(&self) -> GatewayResult<StatusReport> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| GatewayError::internal(format!("Failed to acquire read lock: {e}")))?;

        let mut callers: Vec<CallerStatus> = sessions
            .values()
            .map(|session| CallerStatus {
                caller_id: session.caller_id.clone(),
                created_at: session.created_at,
                last_active: session.last_active,
                transport: session.metadata.clone(),
            })
            .collect();
        callers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.caller_id.cmp(&b.caller_id)));

        Ok(StatusReport {
            active_callers: callers.len(),
            callers,
        })
    }

    /// Evict least-recently-active non-default callers until at most
    /// `max_sessions` of them remain. The caller that triggered the check
    /// always survives it.
    fn enforce_cap(
        sessions: &mut HashMap<String, CallerSession>,
        touched: &str,
        max_sessions: usize,
    ) -> Vec<String> {
        let population = sessions.values().filter(|session| !session.is_default()).count();
        if population <= max_sessions {
            return Vec::new();
        }

        let mut candidates: Vec<(DateTime<Utc>, DateTime<Utc>, String)> = sessions
            .values()
            .filter(|session| !session.is_default() && session.caller_id != touched)
            .map(|session| (session.last_active, session.created_at, session.caller_id.clone()))
            .collect();

        candidates.sort();
        let excess = population - max_sessions;
        let evicted: Vec<String> = candidates
            .into_iter()
            .take(excess)
            .map(|(_, _, caller_id)| caller_id)
            .collect();

        for caller_id in &evicted {
            sessions.remove(caller_id);
        }
        info!(
            "[SessionRegistry] Population cap {} exceeded, evicted {:?}",
            max_sessions, evicted
        );
        evicted
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SESSIONS, crate::clock::system_clock())
    }
}
