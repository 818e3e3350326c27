//! Provider bundle.
//!
//! Every external model docfusion talks to, constructed once from the
//! configuration. Construction checks credentials, so a missing API key
//! fails here, before anything is built or served.

use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::embedding::{create_embedder, Embedder};
use crate::engine::{AnswerSynthesizer, LlmSynthesizer};
use crate::error::ProviderError;
use crate::extract::{LlmTripletExtractor, TripletExtractor};
use crate::llm::create_chat_model;
use crate::rerank::{LlmGrader, RelevanceGrader};

#[derive(Clone)]
pub struct Providers {
    pub embedder: Arc<dyn Embedder>,
    pub extractor: Arc<dyn TripletExtractor>,
    pub grader: Arc<dyn RelevanceGrader>,
    pub synthesizer: Arc<dyn AnswerSynthesizer>,
}

impl Providers {
    /// Build every configured provider.
    ///
    /// Returns [`ProviderError::Auth`] naming the first missing credential.
    pub fn from_config(config: &Config) -> Result<Self, ProviderError> {
        let embedder = create_embedder(&config.embedding)?;
        let extraction = create_chat_model(&config.extraction)?;
        let grading = create_chat_model(&config.grading)?;
        let synthesis = create_chat_model(&config.synthesis.primary)?;
        let fallback = config
            .synthesis
            .fallback
            .as_ref()
            .map(create_chat_model)
            .transpose()?;

        info!(
            embedder = %embedder.model_id(),
            extraction = %extraction.name(),
            grading = %grading.name(),
            synthesis = %synthesis.name(),
            fallback = %fallback.as_ref().map(|m| m.name()).unwrap_or_default(),
            "providers ready"
        );

        Ok(Self {
            embedder,
            extractor: Arc::new(LlmTripletExtractor::new(extraction)),
            grader: Arc::new(LlmGrader::new(grading)),
            synthesizer: Arc::new(LlmSynthesizer::new(synthesis, fallback)),
        })
    }
}
