// Error taxonomy and request-boundary error context
pub mod errors;

// Injectable time source
pub mod clock;

// Configuration resolution from arguments and request headers
pub mod config;

// Authenticated backend sessions
pub mod backend;

// Multi-domain routing
pub mod domain;

// Remote script execution
pub mod task;

// Per-caller connection cache
pub mod connection;

// Caller session management
pub mod session;
pub mod session_store;

// Transport glue
pub mod gateway;
pub mod stdio_wrapper;

// Re-export key types for convenience
pub use backend::{BackendSession, DomainKind, SessionStatus};
pub use config::{Configuration, ConfigurationResolver, ConnectionArgs, Credentials, Region, Target};
pub use connection::ConnectionFactory;
pub use domain::DomainRouter;
pub use errors::{ErrorContext, GatewayError, GatewayResult};
pub use gateway::{Gateway, GatewaySettings, ResultStatus, ToolRequest, ToolResult};
pub use session::{CallerSession, TransportMetadata, DEFAULT_CALLER_ID};
pub use session_store::{SessionRegistry, StatusReport};
pub use stdio_wrapper::StdioWrapper;
pub use task::{BackoffSchedule, RemoteTask, RemoteTaskRunner, TaskOutcome};
