use crate::errors::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;

pub const DEFAULT_MANAGEMENT_PORT: u16 = 443;

/// Lower-cased request header name → value
pub type RequestMetadata = HashMap<String, String>;

/// Header names read by `ConfigurationResolver::from_request_metadata`
pub mod headers {
    pub const API_KEY: &str = "x-api-key";
    pub const USERNAME: &str = "x-username";
    pub const PASSWORD: &str = "x-password";
    pub const BEARER_TOKEN: &str = "x-bearer-token";
    pub const AUTHORIZATION: &str = "authorization";
    pub const TENANT_URL: &str = "x-tenant-url";
    pub const MANAGEMENT_HOST: &str = "x-management-host";
    pub const MANAGEMENT_PORT: &str = "x-management-port";
    pub const REGION: &str = "x-region";
    pub const DOMAIN: &str = "x-domain";
    pub const DEBUG: &str = "x-debug";

    /// Headers that carry connection settings (everything except `x-debug`)
    pub const CONNECTION: &[&str] = &[
        API_KEY,
        USERNAME,
        PASSWORD,
        BEARER_TOKEN,
        AUTHORIZATION,
        TENANT_URL,
        MANAGEMENT_HOST,
        MANAGEMENT_PORT,
        REGION,
        DOMAIN,
    ];
}

/// Cloud region of the infrastructure gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Region {
    #[default]
    Eu,
    Us,
    Staging,
    Local,
}

impl Region {
    /// Map a user-supplied region code onto the fixed set, falling back to EU
    pub fn normalize(raw: Option<&str>) -> Self {
        match raw.map(|r| r.trim().to_ascii_uppercase()).as_deref() {
            Some("EU") => Region::Eu,
            Some("US") => Region::Us,
            Some("STAGING") | Some("DEV") => Region::Staging,
            Some("LOCAL") => Region::Local,
            Some(other) => {
                if !other.is_empty() {
                    tracing::warn!("[Config] Unrecognized region '{}', using EU", other);
                }
                Region::Eu
            }
            None => Region::Eu,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Eu => "EU",
            Region::Us => "US",
            Region::Staging => "STAGING",
            Region::Local => "LOCAL",
        }
    }

    /// Base URL of the cloud infrastructure gateway for this region
    pub fn infra_base_url(&self) -> &'static str {
        match self {
            Region::Eu => "https://cloudinfra-gw.portal.checkpoint.com",
            Region::Us => "https://cloudinfra-gw-us.portal.checkpoint.com",
            Region::Staging => "https://dev-cloudinfra-gw.kube1.iaas.checkpoint.com",
            Region::Local => "http://localhost:8080",
        }
    }
}

/// Secret string that never shows up in `Debug` output
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Secret(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// Authentication material, exactly one method per configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    ApiKey(Secret),
    UserPassword { username: String, password: Secret },
    /// Pre-issued token; no login exchange takes place
    BearerToken(Secret),
}

impl Credentials {
    pub fn method(&self) -> &'static str {
        match self {
            Credentials::ApiKey(_) => "api-key",
            Credentials::UserPassword { .. } => "username-password",
            Credentials::BearerToken(_) => "bearer-token",
        }
    }

    /// Short digest identifying the credentials in logs without revealing them
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.method().as_bytes());
        match self {
            Credentials::ApiKey(key) | Credentials::BearerToken(key) => {
                hasher.update(key.expose().as_bytes());
            }
            Credentials::UserPassword { username, password } => {
                hasher.update(username.as_bytes());
                hasher.update([0u8]);
                hasher.update(password.expose().as_bytes());
            }
        }
        let digest = format!("{:x}", hasher.finalize());
        digest[..12].to_string()
    }
}

/// Where the management API lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    OnPrem { host: String, port: u16 },
    Cloud { base_url: String, region: Region },
}

impl Target {
    /// Name used in logs and error messages
    pub fn display_name(&self) -> String {
        match self {
            Target::OnPrem { host, port } => {
                if host.contains("://") {
                    host.clone()
                } else {
                    format!("{host}:{port}")
                }
            }
            Target::Cloud { base_url, .. } => base_url.clone(),
        }
    }

    /// Root of the web API, without a trailing slash
    pub fn api_base_url(&self) -> String {
        match self {
            Target::OnPrem { host, port } => {
                let root = if host.contains("://") {
                    host.trim_end_matches('/').to_string()
                } else {
                    format!("https://{host}:{port}")
                };
                format!("{root}/web_api")
            }
            Target::Cloud { base_url, .. } => {
                let base = base_url.trim_end_matches('/');
                if base.ends_with("/web_api") {
                    base.to_string()
                } else {
                    format!("{base}/web_api")
                }
            }
        }
    }

    /// On-prem servers ship with self-signed certificates; cloud endpoints never do
    pub fn accepts_invalid_certs(&self) -> bool {
        matches!(self, Target::OnPrem { .. })
    }
}

/// Immutable per-caller configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    pub target: Target,
    pub credentials: Credentials,
    /// Domain to log straight into on a multi-domain server
    pub domain: Option<String>,
    pub debug: bool,
}

impl Configuration {
    /// True when both configurations would authenticate to the same backend the
    /// same way. `debug` is deliberately ignored.
    pub fn same_backend(&self, other: &Configuration) -> bool {
        self.target == other.target
            && self.credentials == other.credentials
            && self.domain == other.domain
    }

    pub fn fingerprint(&self) -> String {
        self.credentials.fingerprint()
    }
}

/// Unvalidated configuration fields gathered from any source
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfiguration {
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub bearer_token: Option<String>,
    pub tenant_url: Option<String>,
    pub management_host: Option<String>,
    pub management_port: Option<u16>,
    pub region: Option<String>,
    pub domain: Option<String>,
    #[serde(default)]
    pub debug: bool,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl RawConfiguration {
    /// Validate and build the immutable configuration
    pub fn resolve(self) -> GatewayResult<Configuration> {
        let api_key = non_empty(self.api_key);
        let username = non_empty(self.username);
        let password = non_empty(self.password);
        let bearer_token = non_empty(self.bearer_token);
        let tenant_url = non_empty(self.tenant_url);
        let management_host = non_empty(self.management_host);
        let region = Region::normalize(self.region.as_deref());

        let target = match (management_host, tenant_url) {
            (Some(_), Some(_)) => {
                return Err(GatewayError::configuration(
                    "both a management host and a cloud tenant URL were supplied; set only one",
                ))
            }
            (Some(host), None) => {
                let port = self.management_port.unwrap_or(DEFAULT_MANAGEMENT_PORT);
                if port == 0 {
                    return Err(GatewayError::configuration(format!(
                        "management port for host '{host}' must be between 1 and 65535"
                    )));
                }
                Target::OnPrem { host, port }
            }
            (None, Some(base_url)) => Target::Cloud { base_url, region },
            (None, None) if bearer_token.is_some() => Target::Cloud {
                base_url: region.infra_base_url().to_string(),
                region,
            },
            (None, None) => {
                return Err(GatewayError::configuration(
                    "no management target: set a management host or a cloud tenant URL",
                ))
            }
        };

        let credentials = match &target {
            Target::OnPrem { host, .. } => {
                if let Some(key) = api_key {
                    Credentials::ApiKey(Secret::new(key))
                } else {
                    match (username, password) {
                        (Some(username), Some(password)) => Credentials::UserPassword {
                            username,
                            password: Secret::new(password),
                        },
                        (Some(_), None) => {
                            return Err(GatewayError::configuration(format!(
                                "username for management host '{host}' was supplied without a password"
                            )))
                        }
                        (None, Some(_)) => {
                            return Err(GatewayError::configuration(format!(
                                "password for management host '{host}' was supplied without a username"
                            )))
                        }
                        (None, None) if bearer_token.is_some() => {
                            return Err(GatewayError::configuration(format!(
                                "management host '{host}' does not accept bearer tokens; supply an API key or a username and password"
                            )))
                        }
                        (None, None) => {
                            return Err(GatewayError::configuration(format!(
                                "management host '{host}' requires an API key or a username and password"
                            )))
                        }
                    }
                }
            }
            Target::Cloud { base_url, .. } => {
                if let Some(token) = bearer_token {
                    Credentials::BearerToken(Secret::new(token))
                } else if let Some(key) = api_key {
                    Credentials::ApiKey(Secret::new(key))
                } else {
                    return Err(GatewayError::configuration(format!(
                        "cloud tenant '{base_url}' requires an API key or a bearer token"
                    )));
                }
            }
        };

        Ok(Configuration {
            target,
            credentials,
            domain: non_empty(self.domain),
            debug: self.debug,
        })
    }
}

/// Connection settings taken from process arguments
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// API key for the management server or cloud tenant
    #[arg(long, env = "TOOLGATE_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Administrator username (on-prem only)
    #[arg(long, env = "TOOLGATE_USERNAME")]
    pub username: Option<String>,

    /// Administrator password (on-prem only)
    #[arg(long, env = "TOOLGATE_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Pre-issued bearer token (cloud only)
    #[arg(long, env = "TOOLGATE_BEARER_TOKEN", hide_env_values = true)]
    pub bearer_token: Option<String>,

    /// Cloud tenant web API URL
    #[arg(long, env = "TOOLGATE_TENANT_URL")]
    pub tenant_url: Option<String>,

    /// On-prem management server host or IP
    #[arg(long, env = "TOOLGATE_MANAGEMENT_HOST")]
    pub management_host: Option<String>,

    /// On-prem management server port
    #[arg(long, env = "TOOLGATE_MANAGEMENT_PORT")]
    pub management_port: Option<u16>,

    /// Cloud region: EU, US, STAGING or LOCAL
    #[arg(long, env = "TOOLGATE_REGION")]
    pub region: Option<String>,

    /// Domain to log into on a multi-domain server
    #[arg(long, env = "TOOLGATE_DOMAIN")]
    pub domain: Option<String>,

    /// Log backend request and response payloads
    #[arg(long, env = "TOOLGATE_DEBUG")]
    pub debug: bool,
}

/// Builds `Configuration` values from process arguments or request metadata
pub struct ConfigurationResolver;

impl ConfigurationResolver {
    pub fn from_args(args: &ConnectionArgs) -> GatewayResult<Configuration> {
        RawConfiguration {
            api_key: args.api_key.clone(),
            username: args.username.clone(),
            password: args.password.clone(),
            bearer_token: args.bearer_token.clone(),
            tenant_url: args.tenant_url.clone(),
            management_host: args.management_host.clone(),
            management_port: args.management_port,
            region: args.region.clone(),
            domain: args.domain.clone(),
            debug: args.debug,
        }
        .resolve()
    }

    pub fn from_request_metadata(meta: &RequestMetadata) -> GatewayResult<Configuration> {
        let get = |name: &str| meta.get(name).cloned();

        let bearer_token = get(headers::BEARER_TOKEN).or_else(|| {
            get(headers::AUTHORIZATION).and_then(|value| {
                value
                    .strip_prefix("Bearer ")
                    .or_else(|| value.strip_prefix("bearer "))
                    .map(str::to_string)
            })
        });

        let management_port = match get(headers::MANAGEMENT_PORT) {
            Some(raw) => Some(raw.trim().parse::<u16>().map_err(|_| {
                GatewayError::configuration(format!(
                    "header '{}' must be a port number, got '{}'",
                    headers::MANAGEMENT_PORT,
                    raw
                ))
            })?),
            None => None,
        };

        RawConfiguration {
            api_key: get(headers::API_KEY),
            username: get(headers::USERNAME),
            password: get(headers::PASSWORD),
            bearer_token,
            tenant_url: get(headers::TENANT_URL),
            management_host: get(headers::MANAGEMENT_HOST),
            management_port,
            region: get(headers::REGION),
            domain: get(headers::DOMAIN),
            debug: Self::debug_flag(meta).unwrap_or(false),
        }
        .resolve()
    }

    /// True when the metadata carries connection settings, as opposed to only a
    /// caller id and perhaps a debug toggle
    pub fn has_connection_metadata(meta: &RequestMetadata) -> bool {
        headers::CONNECTION.iter().any(|name| meta.contains_key(*name))
    }

    /// Parse the `x-debug` header, if present
    pub fn debug_flag(meta: &RequestMetadata) -> Option<bool> {
        meta.get(headers::DEBUG).map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
    }
}
