//! BM25 retriever. Rebuilt from the node store on every load; nothing is
//! persisted.

use async_trait::async_trait;
use docfusion_core::lexical::LexicalIndex;
use docfusion_core::models::{RetrievalResult, RetrieverSource};
use docfusion_core::store::NodeStore;

use crate::error::ProviderError;
use crate::retriever::{ranked, Retriever};

pub struct LexicalRetriever {
    index: LexicalIndex,
}

impl LexicalRetriever {
    pub fn build(nodes: &NodeStore) -> Self {
        Self {
            index: LexicalIndex::build(nodes.nodes()),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

#[async_trait]
impl Retriever for LexicalRetriever {
    fn source(&self) -> RetrieverSource {
        RetrieverSource::Lexical
    }

    async fn retrieve_top_k(&self, query: &str, k: usize) -> Result<Vec<RetrievalResult>, ProviderError> {
        Ok(ranked(RetrieverSource::Lexical, self.index.top_k(query, k)))
    }
}
