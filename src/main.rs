//! # docfusion CLI (`dfx`)
//!
//! ## Usage
//!
//! ```bash
//! dfx --config ./docfusion.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `dfx build [--fresh]` | Ingest docs and build, resume or refresh the index snapshot |
//! | `dfx query "<text>" [--json]` | Answer one question |
//! | `dfx status` | Report snapshot integrity and progress |
//! | `dfx eval <file>` | Run one query per line; print sources used and latency |
//! | `dfx serve mcp [--watch]` | Serve the query tool over MCP stdio |
//! | `dfx serve http [--watch]` | Serve the query tool over HTTP |
//!
//! Logs go to stderr (`RUST_LOG`, default `docfusion=info`); stdout carries
//! command output and, for `serve mcp`, the MCP protocol.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use docfusion::commands::{self, Surface};
use docfusion::config;

/// docfusion — knowledge-graph, vector and keyword retrieval fused into one
/// answer over your technical documentation.
#[derive(Parser)]
#[command(
    name = "dfx",
    about = "docfusion — fused multi-retriever question answering over technical documentation",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./docfusion.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the index snapshot.
    ///
    /// Resumes an interrupted graph build from its last checkpoint, or
    /// refreshes a complete one with only the nodes that changed.
    Build {
        /// Ignore the existing snapshot and build from scratch.
        #[arg(long)]
        fresh: bool,
    },

    /// Answer a question from the documentation.
    Query {
        text: String,

        /// Print the full response (citations, degraded retrievers) as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show snapshot status: not built, corrupt, partial or complete.
    Status,

    /// Run each query in a file and report sources used and latency.
    Eval {
        /// File with one query per line; blank lines and `#` comments are skipped.
        file: PathBuf,
    },

    /// Start a tool server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Subcommand)]
enum ServeService {
    /// MCP over stdio.
    Mcp {
        /// Rebuild and reload when Markdown files change.
        #[arg(long)]
        watch: bool,
    },
    /// JSON over HTTP on `[server].bind`.
    Http {
        /// Rebuild and reload when Markdown files change.
        #[arg(long)]
        watch: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("docfusion=info".parse()?))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Build { fresh } => {
            commands::run_build(&cfg, fresh).await?;
        }
        Commands::Query { text, json } => {
            commands::run_query(&cfg, &text, json).await?;
        }
        Commands::Status => {
            commands::run_status(&cfg)?;
        }
        Commands::Eval { file } => {
            commands::run_eval(&cfg, &file).await?;
        }
        Commands::Serve { service } => match service {
            ServeService::Mcp { watch } => {
                commands::run_serve(cfg, Surface::Mcp, watch).await?;
            }
            ServeService::Http { watch } => {
                commands::run_serve(cfg, Surface::Http, watch).await?;
            }
        },
    }

    Ok(())
}
