//! Authenticated connection to one management backend.
//!
//! `BackendSession` owns the session-id lifecycle: it logs in lazily, checks token
//! freshness before every call, and absorbs exactly one session-invalid rejection
//! per call by logging in again and retrying. HTTP execution lives in `ApiClient`,
//! an immutable value that is re-derived with `ApiClient::with_token` whenever the
//! token changes.

use crate::clock::SharedClock;
use crate::config::{Configuration, Credentials, Target};
use crate::errors::{GatewayError, GatewayResult};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OnceCell, RwLock};
use tracing::{debug, info, warn};

/// Header carrying the backend session id
pub const SESSION_HEADER: &str = "X-chkp-sid";

/// Fixed timeout for every HTTP request to the backend
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A token is treated as expired this many seconds before the backend would expire it
pub const EXPIRY_SAFETY_MARGIN_SECS: i64 = 10;

/// Used when a login response omits `session-timeout`
pub const DEFAULT_SESSION_TIMEOUT_SECS: i64 = 600;

/// Commands whose payloads and responses carry secrets and are never logged
const SENSITIVE_COMMANDS: &[&str] = &["login", "login-to-domain"];

/// Whether the backend partitions its objects into domains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DomainKind {
    SingleDomain,
    MultiDomain,
}

/// How the token is presented to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenScheme {
    /// `X-chkp-sid` header, obtained through a login exchange
    SessionId,
    /// `Authorization: Bearer`, supplied by the caller
    Bearer,
}

/// An authenticated session with the backend
#[derive(Clone)]
pub struct BackendToken {
    value: String,
    pub scheme: TokenScheme,
    pub uid: Option<String>,
    pub issued_at: DateTime<Utc>,
    /// `None` for tokens that never expire locally
    pub timeout: Option<chrono::Duration>,
    pub domain_kind: DomainKind,
}

impl BackendToken {
    pub fn session_id(
        value: impl Into<String>,
        uid: Option<String>,
        issued_at: DateTime<Utc>,
        timeout_secs: i64,
    ) -> Self {
        Self {
            value: value.into(),
            scheme: TokenScheme::SessionId,
            uid,
            issued_at,
            timeout: Some(chrono::Duration::seconds(timeout_secs)),
            domain_kind: DomainKind::SingleDomain,
        }
    }

    pub fn bearer(value: impl Into<String>, issued_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            scheme: TokenScheme::Bearer,
            uid: None,
            issued_at,
            timeout: None,
            domain_kind: DomainKind::SingleDomain,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.timeout.map(|timeout| self.issued_at + timeout)
    }

    /// Valid while `now < issued_at + timeout - margin`
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires_at) => {
                now < expires_at - chrono::Duration::seconds(EXPIRY_SAFETY_MARGIN_SECS)
            }
            None => true,
        }
    }
}

impl fmt::Debug for BackendToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendToken")
            .field("scheme", &self.scheme)
            .field("uid", &self.uid)
            .field("issued_at", &self.issued_at)
            .field("timeout", &self.timeout)
            .field("domain_kind", &self.domain_kind)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
enum Authorization {
    Anonymous,
    SessionId(String),
    Bearer(String),
}

impl fmt::Debug for Authorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Authorization::Anonymous => f.write_str("Anonymous"),
            Authorization::SessionId(_) => f.write_str("SessionId(***)"),
            Authorization::Bearer(_) => f.write_str("Bearer(***)"),
        }
    }
}

/// Immutable HTTP executor for one backend. Authentication is fixed at
/// construction; derive a new value with `with_token` to change it.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    target_name: String,
    authorization: Authorization,
    debug: Arc<AtomicBool>,
}

impl ApiClient {
    pub fn new(target: &Target, debug: Arc<AtomicBool>) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(target.accepts_invalid_certs())
            .build()
            .map_err(|e| GatewayError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: target.api_base_url(),
            target_name: target.display_name(),
            authorization: Authorization::Anonymous,
            debug,
        })
    }

    /// New client presenting `token` on every request
    pub fn with_token(&self, token: &BackendToken) -> ApiClient {
        let authorization = match token.scheme {
            TokenScheme::SessionId => Authorization::SessionId(token.value.clone()),
            TokenScheme::Bearer => Authorization::Bearer(token.value.clone()),
        };
        ApiClient {
            authorization,
            ..self.clone()
        }
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn debug_enabled(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    /// POST `<base>/<command>` with a JSON payload
    pub async fn post(&self, command: &str, payload: &Value) -> GatewayResult<Value> {
        let url = format!("{}/{}", self.base_url, command);
        let sensitive = SENSITIVE_COMMANDS.contains(&command);

        if self.debug_enabled() {
            if sensitive {
                info!("[ApiClient] → {} {} [payload redacted]", self.target_name, command);
            } else {
                info!("[ApiClient] → {} {} {}", self.target_name, command, payload);
            }
        } else {
            debug!("[ApiClient] → {} {}", self.target_name, command);
        }

        let mut request = self.http.post(&url).json(payload);
        request = match &self.authorization {
            Authorization::Anonymous => request,
            Authorization::SessionId(sid) => request.header(SESSION_HEADER, sid),
            Authorization::Bearer(token) => request.bearer_auth(token),
        };

        let response = request.send().await.map_err(|e| GatewayError::Transport {
            target: self.target_name.clone(),
            reason: e.to_string(),
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| GatewayError::Transport {
            target: self.target_name.clone(),
            reason: e.to_string(),
        })?;

        if self.debug_enabled() && !sensitive {
            info!("[ApiClient] ← {} {} HTTP {} {}", self.target_name, command, status, body);
        } else {
            debug!("[ApiClient] ← {} {} HTTP {}", self.target_name, command, status);
        }

        if status.is_success() {
            if body.trim().is_empty() {
                return Ok(json!({}));
            }
            return serde_json::from_str(&body).map_err(|e| GatewayError::MalformedResponse {
                command: command.to_string(),
                reason: format!("response is not JSON: {e}"),
            });
        }

        if is_session_invalid(status.as_u16(), &body) {
            return Err(GatewayError::SessionExpired {
                target: self.target_name.clone(),
                message: body,
            });
        }

        Err(GatewayError::Backend {
            command: command.to_string(),
            status: status.as_u16(),
            body,
        })
    }
}

/// A rejected session is an HTTP 401 whose message mentions the session.
/// Other 401s (bad credentials, missing permissions) are real failures.
pub fn is_session_invalid(status: u16, body: &str) -> bool {
    if status != 401 {
        return false;
    }
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.to_string());
    message.to_ascii_lowercase().contains("session")
}

/// How a session obtains its token
pub enum LoginMethod {
    /// Direct login with caller credentials, optionally into a named domain
    Credentials {
        credentials: Credentials,
        domain: Option<String>,
    },
    /// Secondary login into one domain through an authenticated parent session
    Domain {
        parent: Arc<BackendSession>,
        domain: String,
    },
}

#[derive(Debug, Clone)]
enum SessionState {
    Unauthenticated,
    Authenticating,
    Authenticated(Arc<BackendToken>),
    Expired,
}

/// Observable state of a `BackendSession`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionStatus {
    Unauthenticated,
    Authenticating,
    Authenticated,
    Expired,
}

pub struct BackendSession {
    name: String,
    api: ApiClient,
    login: LoginMethod,
    state: RwLock<SessionState>,
    /// Held for the whole login exchange so concurrent callers wait instead of
    /// issuing parallel logins
    login_gate: Mutex<()>,
    domain_kind: OnceCell<DomainKind>,
    clock: SharedClock,
    logins: AtomicU64,
}

impl BackendSession {
    pub fn new(name: impl Into<String>, api: ApiClient, login: LoginMethod, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            api,
            login,
            state: RwLock::new(SessionState::Unauthenticated),
            login_gate: Mutex::new(()),
            domain_kind: OnceCell::new(),
            clock,
            logins: AtomicU64::new(0),
        }
    }

    /// Primary session for a caller configuration
    pub fn primary(
        config: &Configuration,
        debug: Arc<AtomicBool>,
        clock: SharedClock,
    ) -> GatewayResult<Self> {
        let api = ApiClient::new(&config.target, debug)?;
        Ok(Self::new(
            "primary",
            api,
            LoginMethod::Credentials {
                credentials: config.credentials.clone(),
                domain: config.domain.clone(),
            },
            clock,
        ))
    }

    /// Secondary session scoped to `domain`, authenticated through `parent`
    pub fn for_domain(parent: Arc<BackendSession>, domain: impl Into<String>) -> Self {
        let domain = domain.into();
        let api = parent.api.clone();
        let clock = Arc::clone(&parent.clock);
        Self::new(
            format!("domain:{domain}"),
            api,
            LoginMethod::Domain { parent, domain },
            clock,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target_name(&self) -> &str {
        self.api.target_name()
    }

    /// Number of completed logins over the life of this session
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }

    pub async fn status(&self) -> SessionStatus {
        match &*self.state.read().await {
            SessionState::Unauthenticated => SessionStatus::Unauthenticated,
            SessionState::Authenticating => SessionStatus::Authenticating,
            SessionState::Authenticated(token) if token.is_fresh(self.clock.utc()) => {
                SessionStatus::Authenticated
            }
            SessionState::Authenticated(_) | SessionState::Expired => SessionStatus::Expired,
        }
    }

    /// Domain classification, logging in first if needed
    pub async fn domain_kind(&self) -> GatewayResult<DomainKind> {
        Ok(self.current_token().await?.domain_kind)
    }

    /// Execute `command`, logging in first if needed. A session-invalid rejection
    /// triggers one re-login and one retry; anything after that propagates.
    pub async fn call(&self, command: &str, payload: &Value) -> GatewayResult<Value> {
        let token = self.current_token().await?;

        match self.api.with_token(&token).post(command, payload).await {
            Err(GatewayError::SessionExpired { .. }) => {
                if token.scheme == TokenScheme::Bearer {
                    return Err(GatewayError::Authentication {
                        target: self.target_name().to_string(),
                        reason: "the bearer token was rejected as an invalid session".to_string(),
                    });
                }

                warn!(
                    "[BackendSession:{}] Session rejected by {} during '{}', logging in again",
                    self.name,
                    self.target_name(),
                    command
                );
                self.invalidate(&token).await;

                let token = self.current_token().await?;
                match self.api.with_token(&token).post(command, payload).await {
                    Err(GatewayError::SessionExpired { message, .. }) => Err(GatewayError::Backend {
                        command: command.to_string(),
                        status: 401,
                        body: message,
                    }),
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Best-effort logout; the session returns to `Unauthenticated` either way
    pub async fn logout(&self) -> GatewayResult<()> {
        let _gate = self.login_gate.lock().await;
        let previous = std::mem::replace(&mut *self.state.write().await, SessionState::Unauthenticated);

        if let SessionState::Authenticated(token) = previous {
            if token.scheme == TokenScheme::SessionId && token.is_fresh(self.clock.utc()) {
                self.api.with_token(&token).post("logout", &json!({})).await?;
                debug!("[BackendSession:{}] Logged out of {}", self.name, self.target_name());
            }
        }
        Ok(())
    }

    /// Mark `token` as rejected unless it was already replaced
    async fn invalidate(&self, token: &Arc<BackendToken>) {
        let mut state = self.state.write().await;
        if let SessionState::Authenticated(current) = &*state {
            if Arc::ptr_eq(current, token) {
                *state = SessionState::Expired;
            }
        }
    }

    async fn fresh_token(&self) -> Option<Arc<BackendToken>> {
        let stale = {
            let state = self.state.read().await;
            match &*state {
                SessionState::Authenticated(token) if token.is_fresh(self.clock.utc()) => {
                    return Some(Arc::clone(token));
                }
                SessionState::Authenticated(token) => Some(Arc::clone(token)),
                _ => None,
            }
        };

        // Expiry is detected lazily: flip to Expired unless someone swapped the token
        if let Some(stale) = stale {
            debug!("[BackendSession:{}] Token for {} expired", self.name, self.target_name());
            self.invalidate(&stale).await;
        }
        None
    }

    async fn current_token(&self) -> GatewayResult<Arc<BackendToken>> {
        if let Some(token) = self.fresh_token().await {
            return Ok(token);
        }

        let _gate = self.login_gate.lock().await;

        // Another caller may have finished logging in while we waited
        if let Some(token) = self.fresh_token().await {
            return Ok(token);
        }

        *self.state.write().await = SessionState::Authenticating;

        match self.login().await {
            Ok(token) => {
                let token = Arc::new(token);
                *self.state.write().await = SessionState::Authenticated(Arc::clone(&token));
                self.logins.fetch_add(1, Ordering::Relaxed);
                info!(
                    "[BackendSession:{}] Authenticated to {} ({:?})",
                    self.name,
                    self.target_name(),
                    token.domain_kind
                );
                Ok(token)
            }
            Err(e) => {
                *self.state.write().await = SessionState::Unauthenticated;
                Err(e)
            }
        }
    }

    async fn login(&self) -> GatewayResult<BackendToken> {
        let now = self.clock.utc();

        match &self.login {
            LoginMethod::Credentials {
                credentials,
                domain,
            } => {
                let mut body = match credentials {
                    Credentials::BearerToken(token) => {
                        return Ok(BackendToken::bearer(token.expose(), now));
                    }
                    Credentials::ApiKey(key) => json!({ "api-key": key.expose() }),
                    Credentials::UserPassword { username, password } => {
                        json!({ "user": username, "password": password.expose() })
                    }
                };
                if let Some(domain) = domain {
                    body["domain"] = json!(domain);
                }

                debug!(
                    "[BackendSession:{}] Logging in to {} with {} ({})",
                    self.name,
                    self.target_name(),
                    credentials.method(),
                    credentials.fingerprint()
                );

                let response = self
                    .api
                    .post("login", &body)
                    .await
                    .map_err(|e| self.authentication_error(e))?;
                let mut token = self.token_from_login(&response, now)?;
                token.domain_kind = self.classify(&token).await;
                Ok(token)
            }

            LoginMethod::Domain { parent, domain } => {
                debug!("[BackendSession:{}] Logging in to domain '{}'", self.name, domain);
                let response = Box::pin(parent.call("login-to-domain", &json!({ "domain": domain })))
                    .await
                    .map_err(|e| self.authentication_error(e))?;
                self.token_from_login(&response, now)
            }
        }
    }

    fn token_from_login(&self, response: &Value, now: DateTime<Utc>) -> GatewayResult<BackendToken> {
        let sid = response
            .get("sid")
            .and_then(Value::as_str)
            .filter(|sid| !sid.is_empty())
            .ok_or_else(|| GatewayError::Authentication {
                target: self.target_name().to_string(),
                reason: "login response did not contain a session id".to_string(),
            })?;
        let timeout = response
            .get("session-timeout")
            .and_then(Value::as_i64)
            .unwrap_or(DEFAULT_SESSION_TIMEOUT_SECS);
        let uid = response
            .get("uid")
            .and_then(Value::as_str)
            .map(str::to_string);

        Ok(BackendToken::session_id(sid, uid, now, timeout))
    }

    /// One-time `show-session` lookup; the result holds for the life of this session
    async fn classify(&self, token: &BackendToken) -> DomainKind {
        if let Some(kind) = self.domain_kind.get() {
            return *kind;
        }

        let Some(uid) = &token.uid else {
            return DomainKind::SingleDomain;
        };

        match self
            .api
            .with_token(token)
            .post("show-session", &json!({ "uid": uid }))
            .await
        {
            Ok(response) => {
                let kind = if response
                    .pointer("/domain/domain-type")
                    .and_then(Value::as_str)
                    == Some("mds")
                {
                    DomainKind::MultiDomain
                } else {
                    DomainKind::SingleDomain
                };
                let _ = self.domain_kind.set(kind);
                kind
            }
            Err(e) => {
                // Not cached, so the next login classifies again
                warn!(
                    "[BackendSession:{}] Could not classify {}: {}; assuming single domain",
                    self.name,
                    self.target_name(),
                    e
                );
                DomainKind::SingleDomain
            }
        }
    }

    fn authentication_error(&self, error: GatewayError) -> GatewayError {
        let reason = match error {
            GatewayError::Backend { status, body, .. } => {
                let message = serde_json::from_str::<Value>(&body)
                    .ok()
                    .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                    .unwrap_or(body);
                format!("HTTP {status}: {message}")
            }
            GatewayError::SessionExpired { .. } => "session rejected during login".to_string(),
            GatewayError::Authentication { reason, .. } => reason,
            GatewayError::Transport { .. } => return error,
            other => other.to_string(),
        };
        GatewayError::Authentication {
            target: match &self.login {
                LoginMethod::Domain { domain, .. } => format!("{} (domain '{}')", self.target_name(), domain),
                LoginMethod::Credentials { .. } => self.target_name().to_string(),
            },
            reason,
        }
    }
}

impl fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSession")
            .field("name", &self.name)
            .field("target", &self.api.target_name)
            .field("logins", &self.login_count())
            .finish_non_exhaustive()
    }
}
