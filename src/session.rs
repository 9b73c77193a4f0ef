use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Caller id used by the single-caller stdio transport. Never evicted.
pub const DEFAULT_CALLER_ID: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Stdio,
    Http,
}

/// Opaque transport details recorded for status reporting
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportMetadata {
    pub transport: TransportKind,
    pub origin: Option<String>,
    pub user_agent: Option<String>,
}

impl TransportMetadata {
    pub fn stdio() -> Self {
        Self::default()
    }

    pub fn http(origin: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            transport: TransportKind::Http,
            origin,
            user_agent,
        }
    }
}

/// One logical client of the gateway, independent of any backend session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallerSession {
    pub caller_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    pub metadata: TransportMetadata,
}

impl CallerSession {
    pub fn new(caller_id: impl Into<String>, metadata: TransportMetadata, now: DateTime<Utc>) -> Self {
        Self {
            caller_id: caller_id.into(),
            created_at: now,
            last_active: now,
            metadata,
        }
    }

    pub fn is_default(&self) -> bool {
        self.caller_id == DEFAULT_CALLER_ID
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_active = now;
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_active
    }
}
