//! # docfusion
//!
//! Question answering over technical documentation by fusing three
//! retrievers: dense vectors, an LLM-extracted knowledge graph, and BM25.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐   ┌────────────┐   ┌───────────────────────────────┐
//! │  docs  │──▶│   ingest   │──▶│ graph builder (checkpointed)  │──┐
//! │ (*.md) │   │ nodes      │   │ vector builder (by hash)      │  │ snapshot
//! └────────┘   └────────────┘   └───────────────────────────────┘  │ (gen-N/)
//!                                                                  ▼
//!          ┌─────────────────────────────────────────────────────────┐
//! query ──▶│ fusion retriever: vector ∥ graph ∥ lexical ─▶ RRF       │
//!          │ reranker: graded batches, fallback to fused order       │
//!          │ synthesizer: answer + citations                         │
//!          └─────────────────────────────────────────────────────────┘
//!                         ▲                          │
//!                   MCP stdio / HTTP            rebuild worker ◀── file watch
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! dfx build                     # ingest, extract triplets, embed
//! dfx query "How do I get the ball velocity?"
//! dfx status
//! dfx serve mcp --watch         # MCP tool, live re-indexing
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Typed build and query errors |
//! | [`retry`] | Backoff for provider calls |
//! | [`llm`] | Chat-completion providers |
//! | [`embedding`] | Embedding providers |
//! | [`extract`] | Triplet extraction |
//! | [`providers`] | Provider bundle with credential checks |
//! | [`ingest`] | Markdown loading and node parsing |
//! | [`snapshot`] | Atomic on-disk index snapshot |
//! | [`graph`] | Checkpointed knowledge-graph builder and graph retriever |
//! | [`vector`] | Vector index builder and retriever |
//! | [`lexical`] | BM25 retriever |
//! | [`retriever`] | Retriever trait and rank fusion |
//! | [`rerank`] | LLM relevance reranking |
//! | [`engine`] | Query engine and answer synthesis |
//! | [`stack`] | Build pipeline and engine assembly |
//! | [`rebuild`] | Serialized rebuild worker |
//! | [`watch`] | File-change bridge |
//! | [`server`] | HTTP tool server |
//! | [`mcp`] | MCP stdio server |
//! | [`status`] | Snapshot integrity report |
//! | [`commands`] | CLI command implementations |

pub mod commands;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod graph;
pub mod ingest;
pub mod lexical;
pub mod llm;
pub mod mcp;
pub mod providers;
pub mod rebuild;
pub mod rerank;
pub mod retriever;
pub mod retry;
pub mod server;
pub mod snapshot;
pub mod stack;
pub mod status;
pub mod vector;
pub mod watch;
