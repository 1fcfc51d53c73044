// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Term-frequency search over an in-memory, per-tenant index.
//!
//! Score of a document = Σ over query terms of `tf × idf`, where
//! `tf = count / document_length` and `idf = ln(1 + N / df)`.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::capability::{Backend, SearchBackend, SearchHit};
use crate::domain::envelope::TenantId;
use crate::domain::errors::BackendError;

#[derive(Default)]
struct TenantIndex {
    /// document → (term → count, total terms)
    documents: HashMap<String, (HashMap<String, usize>, usize)>,
}

pub struct LocalSearchIndex {
    name: String,
    tenants: RwLock<HashMap<TenantId, TenantIndex>>,
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl LocalSearchIndex {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tenants: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for LocalSearchIndex {
    fn default() -> Self {
        Self::new("local-tf-search")
    }
}

#[async_trait]
impl Backend for LocalSearchIndex {
    fn name(&self) -> &str {
        &self.name
    }

    async fn health_check(&self) -> Result<(), BackendError> {
        Ok(())
    }
}

#[async_trait]
impl SearchBackend for LocalSearchIndex {
    async fn index_document(&self, tenant: &TenantId, document_id: &str, text: &str) -> Result<(), BackendError> {
        if document_id.is_empty() {
            return Err(BackendError::InvalidRequest("document id cannot be empty".to_string()));
        }
        let tokens = tokenize(text);
        let mut counts: HashMap<String, usize> = HashMap::new();
        for token in &tokens {
            *counts.entry(token.clone()).or_default() += 1;
        }
        self.tenants
            .write()
            .entry(tenant.clone())
            .or_default()
            .documents
            .insert(document_id.to_string(), (counts, tokens.len()));
        Ok(())
    }

    async fn search(&self, tenant: &TenantId, query: &str, limit: usize) -> Result<Vec<SearchHit>, BackendError> {
        let terms = tokenize(query);
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let tenants = self.tenants.read();
        let Some(index) = tenants.get(tenant) else {
            return Ok(Vec::new());
        };

        let n = index.documents.len() as f64;
        let idf: HashMap<&str, f64> = terms
            .iter()
            .map(|term| {
                let df = index.documents.values().filter(|(c, _)| c.contains_key(term)).count() as f64;
                (term.as_str(), if df == 0.0 { 0.0 } else { (1.0 + n / df).ln() })
            })
            .collect();

        let mut hits: Vec<SearchHit> = index
            .documents
            .iter()
            .filter_map(|(id, (counts, len))| {
                if *len == 0 {
                    return None;
                }
                let score: f64 = terms
                    .iter()
                    .map(|term| {
                        let tf = *counts.get(term).unwrap_or(&0) as f64 / *len as f64;
                        tf * idf.get(term.as_str()).copied().unwrap_or(0.0)
                    })
                    .sum();
                (score > 0.0).then(|| SearchHit {
                    document_id: id.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        hits.truncate(limit);
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ranks_by_term_frequency() {
        let search = LocalSearchIndex::default();
        let t = TenantId::new("tenant-a");
        search.index_document(&t, "d1", "circuit breaker opens on failure").await.unwrap();
        search.index_document(&t, "d2", "Breaker breaker breaker!").await.unwrap();
        search.index_document(&t, "d3", "reply dispatcher retries").await.unwrap();

        let hits = search.search(&t, "breaker", 10).await.unwrap();
        assert_eq!(hits.iter().map(|h| h.document_id.as_str()).collect::<Vec<_>>(), vec!["d2", "d1"]);

        assert_eq!(search.search(&t, "breaker", 1).await.unwrap().len(), 1);
        assert!(search.search(&t, "nothing here", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tenants_see_only_their_documents() {
        let search = LocalSearchIndex::default();
        search.index_document(&"a".into(), "d1", "secret plan").await.unwrap();
        assert!(search.search(&"b".into(), "secret", 10).await.unwrap().is_empty());
    }
}
