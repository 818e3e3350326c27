//! # docfusion core
//!
//! Runtime-free logic shared by the `docfusion` builders and query path:
//! data models, Markdown node parsing, the BM25 lexical index, triplet
//! ranking, reciprocal-rank fusion and rerank ordering.
//!
//! This crate contains no tokio, network clients or filesystem I/O. Every
//! function here is a deterministic transformation over its inputs, which
//! is what lets the fusion and reranking behaviour be tested exactly.

pub mod chunk;
pub mod embedding;
pub mod fusion;
pub mod graph;
pub mod lexical;
pub mod models;
pub mod rerank;
pub mod store;
