//! Knowledge-triplet extraction.
//!
//! The graph builder calls a [`TripletExtractor`] once per node. The LLM
//! implementation asks for up to K `(subject, predicate, object)` lines and
//! parses whatever well-formed triplets come back; prose and malformed
//! lines are ignored.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use docfusion_core::models::{Node, Triplet};

use crate::error::ProviderError;
use crate::llm::ChatModel;

#[async_trait]
pub trait TripletExtractor: Send + Sync {
    /// Extract at most `max_triplets` triplets from `node`.
    async fn extract(&self, node: &Node, max_triplets: usize) -> Result<Vec<Triplet>, ProviderError>;
}

pub struct LlmTripletExtractor {
    model: Arc<dyn ChatModel>,
}

impl LlmTripletExtractor {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl TripletExtractor for LlmTripletExtractor {
    async fn extract(&self, node: &Node, max_triplets: usize) -> Result<Vec<Triplet>, ProviderError> {
        let prompt = extraction_prompt(&node.indexed_text(), max_triplets);
        let reply = self.model.complete(&prompt).await?;
        Ok(parse_triplets(&reply, &node.id, max_triplets))
    }
}

fn extraction_prompt(text: &str, max_triplets: usize) -> String {
    format!(
        "Some text is provided below. Given the text, extract up to {max} knowledge triplets \
in the form of (subject, predicate, object). Prefer API names, classes, methods and \
parameters as subjects and objects. Avoid stopwords.\n\
---------------------\n\
Example:\n\
Text: CarWrapper exposes GetVelocity, which returns a Vector.\n\
Triplets:\n\
(CarWrapper, has method, GetVelocity)\n\
(GetVelocity, returns, Vector)\n\
---------------------\n\
Text: {text}\n\
Triplets:\n",
        max = max_triplets,
        text = text
    )
}

/// Parse `(subject, predicate, object)` lines from a model reply.
///
/// Commas after the second one belong to the object. Duplicate triplets
/// (case-insensitive) are dropped; at most `max_triplets` are kept.
pub fn parse_triplets(reply: &str, node_id: &str, max_triplets: usize) -> Vec<Triplet> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    for line in reply.lines() {
        if out.len() >= max_triplets {
            break;
        }
        let Some(start) = line.find('(') else { continue };
        let Some(end) = line.rfind(')') else { continue };
        if end <= start {
            continue;
        }

        let mut parts = line[start + 1..end].splitn(3, ',').map(clean_part);
        let (Some(subject), Some(predicate), Some(object)) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        if subject.is_empty() || predicate.is_empty() || object.is_empty() {
            continue;
        }

        let key = (
            subject.to_lowercase(),
            predicate.to_lowercase(),
            object.to_lowercase(),
        );
        if !seen.insert(key) {
            continue;
        }

        out.push(Triplet {
            subject,
            predicate,
            object,
            source_node_id: node_id.to_string(),
            confidence: 1.0,
        });
    }

    out
}

fn clean_part(part: &str) -> String {
    part.trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim()
        .to_string()
}
