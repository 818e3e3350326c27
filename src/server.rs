//! HTTP tool surface.
//!
//! Serves the query tool over a small JSON API. The same tool is exposed
//! over MCP stdio by [`crate::mcp`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (version, engine revision, node count) |
//! | `GET`  | `/tools/list` | The single query tool and its input schema |
//! | `POST` | `/tools/{name}` | Call the query tool; `{"result": "<answer text>"}` |
//! | `POST` | `/query` | Full [`QueryResponse`] JSON |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! | Code | Status | When |
//! |------|--------|------|
//! | `bad_request` | 400 | missing or empty `query` |
//! | `not_found` | 404 | unknown tool name |
//! | `retrieval_unavailable` | 503 | every retriever failed |
//! | `provider_error` | 502 | answer synthesis failed |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::engine::QueryResponse;
use crate::error::QueryError;
use crate::rebuild::LiveEngine;

pub const TOOL_DESCRIPTION: &str = "Answer a technical question from the indexed documentation. \
Retrieval fuses semantic, knowledge-graph and exact-keyword search; the answer lists its sources.";

/// JSON schema of the tool input: `{ "query": string }`, required.
pub fn tool_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string", "description": "The technical question." }
        },
        "required": ["query"]
    })
}

/// Pull a non-empty `query` string out of tool arguments.
pub fn query_param(params: &Value) -> Result<String, String> {
    match params.get("query") {
        Some(Value::String(q)) if !q.trim().is_empty() => Ok(q.trim().to_string()),
        Some(Value::String(_)) => Err("query must not be empty".to_string()),
        Some(_) => Err("query must be a string".to_string()),
        None => Err("missing required parameter: query".to_string()),
    }
}

/// Plain-text tool output: the answer followed by a sources footer.
pub fn format_answer(response: &QueryResponse) -> String {
    let mut out = response.answer.trim_end().to_string();
    if !response.citations.is_empty() {
        out.push_str("\n\nSources:\n");
        for (i, c) in response.citations.iter().enumerate() {
            if c.heading_path.is_empty() {
                out.push_str(&format!("{}. {}\n", i + 1, c.source_path));
            } else {
                out.push_str(&format!("{}. {} — {}\n", i + 1, c.source_path, c.heading_path.join(" > ")));
            }
        }
    }
    if response.is_degraded() {
        let missing: Vec<&str> = response.degraded.iter().map(|f| f.source.as_str()).collect();
        out.push_str(&format!("\n(degraded: {} retrieval unavailable)\n", missing.join(", ")));
    }
    out
}

#[derive(Clone)]
struct AppState {
    tool_name: String,
    engine: watch::Receiver<LiveEngine>,
}

/// Build the router. `engine` always yields the engine to query with.
pub fn router(tool_name: &str, engine: watch::Receiver<LiveEngine>) -> Router {
    let state = AppState {
        tool_name: tool_name.to_string(),
        engine,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .route("/query", post(handle_query))
        .layer(cors)
        .with_state(state)
}

/// Bind `bind` and serve until the process is terminated.
pub async fn run_http(bind: &str, tool_name: &str, engine: watch::Receiver<LiveEngine>) -> anyhow::Result<()> {
    let app = router(tool_name, engine);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind = %bind, tool = %tool_name, "http server listening");
    println!("docfusion listening on http://{}", bind);
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

impl From<QueryError> for AppError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::RetrievalUnavailable { .. } => AppError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "retrieval_unavailable",
                message: err.to_string(),
            },
            QueryError::Synthesis(_) => AppError {
                status: StatusCode::BAD_GATEWAY,
                code: "provider_error",
                message: err.to_string(),
            },
        }
    }
}

async fn run_query(state: &AppState, params: &Value) -> Result<QueryResponse, AppError> {
    let query = query_param(params).map_err(bad_request)?;
    // Clone out of the watch so a rebuild can publish while we query.
    let live = state.engine.borrow().clone();
    Ok(live.engine.query(&query).await?)
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    revision: u64,
    nodes: usize,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let live = state.engine.borrow().clone();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        revision: live.revision,
        nodes: live.engine.node_count(),
    })
}

// ============ GET /tools/list ============

async fn handle_list_tools(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "tools": [{
            "name": state.tool_name,
            "description": TOOL_DESCRIPTION,
            "parameters": tool_schema(),
        }]
    }))
}

// ============ POST /tools/{name} ============

async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<Value>,
) -> Result<Json<Value>, AppError> {
    if name != state.tool_name {
        return Err(not_found(format!("no tool registered with name: {}", name)));
    }
    let response = run_query(&state, &params).await?;
    Ok(Json(json!({ "result": format_answer(&response) })))
}

// ============ POST /query ============

async fn handle_query(State(state): State<AppState>, Json(params): Json<Value>) -> Result<Json<QueryResponse>, AppError> {
    Ok(Json(run_query(&state, &params).await?))
}
