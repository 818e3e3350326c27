//! MCP stdio server.
//!
//! Exposes exactly one tool (named by `[server].tool_name`) taking
//! `{ "query": string }` and returning the plain-text answer with a sources
//! footer. stdout carries the JSON-RPC framing, so all logging goes to
//! stderr.
//!
//! # Cursor Integration
//!
//! ```json
//! {
//!   "mcpServers": {
//!     "docfusion": {
//!       "command": "dfx",
//!       "args": ["--config", "/path/to/docfusion.toml", "serve", "mcp", "--watch"]
//!     }
//!   }
//! }
//! ```

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::transport::stdio;
use rmcp::{ErrorData as McpError, ServerHandler, ServiceExt};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::rebuild::LiveEngine;
use crate::server::{format_answer, query_param, tool_schema, TOOL_DESCRIPTION};

/// Each MCP session gets a clone; the engine is read through the watch
/// channel on every call.
#[derive(Clone)]
pub struct McpBridge {
    tool_name: String,
    engine: watch::Receiver<LiveEngine>,
}

impl McpBridge {
    pub fn new(tool_name: &str, engine: watch::Receiver<LiveEngine>) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            engine,
        }
    }

    fn tool(&self) -> Tool {
        let input_schema: Arc<serde_json::Map<String, serde_json::Value>> = match tool_schema() {
            serde_json::Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };

        Tool {
            name: Cow::Owned(self.tool_name.clone()),
            title: None,
            description: Some(Cow::Borrowed(TOOL_DESCRIPTION)),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(true)),
            execution: None,
            icons: None,
            meta: None,
        }
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "docfusion".to_string(),
                title: Some("docfusion".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Use the {} tool to ask technical questions about the indexed documentation.",
                self.tool_name
            )),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult::with_all_items(vec![self.tool()])))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        (name == self.tool_name).then(|| self.tool())
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        if request.name != self.tool_name {
            return Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            ));
        }

        let params = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));
        let query = query_param(&params).map_err(|msg| McpError::invalid_params(msg, None))?;

        info!(query = %query, "mcp query");
        let live = self.engine.borrow().clone();
        match live.engine.query(&query).await {
            Ok(response) => Ok(CallToolResult::success(vec![Content::text(format_answer(&response))])),
            Err(e) => {
                warn!(error = %e, "mcp query failed");
                Ok(CallToolResult::error(vec![Content::text(e.to_string())]))
            }
        }
    }
}

/// Serve the bridge over stdin/stdout until the client disconnects.
pub async fn run_stdio(bridge: McpBridge) -> anyhow::Result<()> {
    let service = bridge.serve(stdio()).await?;
    info!("mcp server running on stdio");
    service.waiting().await?;
    Ok(())
}
