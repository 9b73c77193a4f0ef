use crate::clock::system_clock;
use crate::config::{Configuration, RequestMetadata};
use crate::errors::{ErrorContext, GatewayError};
use crate::gateway::{Gateway, GatewaySettings, ToolRequest, ToolResult};
use crate::session::{TransportMetadata, DEFAULT_CALLER_ID};
use anyhow::Result;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// Single-caller transport: one JSON `ToolRequest` per stdin line, one
/// `ToolResult` per stdout line. Every request runs as the `default` caller.
pub struct StdioWrapper {
    gateway: Arc<Gateway>,
    rt: Runtime,
}

impl StdioWrapper {
    pub fn new(gateway: Arc<Gateway>) -> Result<Self> {
        let rt = Runtime::new()?;
        Ok(Self { gateway, rt })
    }

    /// Build a gateway whose `default` caller uses `config`
    pub fn with_configuration(config: Configuration, settings: GatewaySettings) -> Result<Self> {
        let rt = Runtime::new()?;
        let gateway = rt.block_on(Gateway::new(settings, system_clock()).with_default_configuration(config))?;
        Ok(Self {
            gateway: Arc::new(gateway),
            rt,
        })
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub fn run(&self) -> Result<()> {
        let stdin = io::stdin();
        let mut stdout = io::stdout();
        self.run_with(stdin.lock(), &mut stdout)
    }

    pub fn run_with<R: BufRead, W: Write>(&self, input: R, output: &mut W) -> Result<()> {
        info!("[StdioWrapper] Ready for requests on stdin");
        let metadata = RequestMetadata::new();

        for line in input.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let result = match serde_json::from_str::<ToolRequest>(&line) {
                Ok(request) => self.rt.block_on(self.gateway.handle(
                    DEFAULT_CALLER_ID,
                    &metadata,
                    TransportMetadata::stdio(),
                    request,
                )),
                Err(e) => {
                    warn!("[StdioWrapper] Failed to parse request: {}", e);
                    ToolResult::failure(&ErrorContext::new(GatewayError::InvalidRequest {
                        reason: format!("request is not a valid tool call: {e}"),
                    }))
                }
            };

            writeln!(output, "{}", serde_json::to_string(&result)?)?;
            output.flush()?;
        }

        debug!("[StdioWrapper] stdin closed, logging out");
        self.rt.block_on(self.gateway.shutdown());
        Ok(())
    }
}
