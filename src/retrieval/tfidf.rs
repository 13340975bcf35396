//! TF-IDF chunk ranking
//!
//! Small corpora do not justify an embedding service; cosine similarity
//! over TF-IDF vectors is enough to surface the right policy chunk and
//! keeps retrieval reproducible. Term maps are BTreeMaps so weight
//! accumulation order, and therefore every floating point sum, is
//! identical on every run.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use itertools::Itertools;

use super::chunker::DocChunk;
use super::{RetrievalService, RetrievedChunk};

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "in", "on", "at", "of", "for", "to", "and",
    "or", "it", "this", "that", "with", "as", "by", "be", "from", "what", "which", "how", "did",
    "do", "does", "during", "per",
];

fn tokenize(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    lowered
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| token.len() >= 2 && !STOP_WORDS.contains(token))
        .map(|token| token.to_string())
        .collect()
}

pub struct TfIdfIndex {
    chunks: Vec<DocChunk>,
    idf: BTreeMap<String, f64>,
    vectors: Vec<BTreeMap<String, f64>>,
}

impl TfIdfIndex {
    pub fn build(chunks: Vec<DocChunk>) -> Self {
        let token_lists: Vec<Vec<String>> = chunks.iter().map(|c| tokenize(&c.text)).collect();

        let mut document_frequency: BTreeMap<String, usize> = BTreeMap::new();
        for tokens in &token_lists {
            for term in tokens.iter().unique() {
                *document_frequency.entry(term.clone()).or_insert(0) += 1;
            }
        }

        let total = chunks.len().max(1) as f64;
        let idf: BTreeMap<String, f64> = document_frequency
            .into_iter()
            .map(|(term, count)| (term, (total / count as f64).ln() + 1.0))
            .collect();

        let vectors = token_lists
            .iter()
            .map(|tokens| Self::vectorize(&idf, tokens))
            .collect();

        Self {
            chunks,
            idf,
            vectors,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn vectorize(idf: &BTreeMap<String, f64>, tokens: &[String]) -> BTreeMap<String, f64> {
        let mut counts: BTreeMap<&str, f64> = BTreeMap::new();
        for token in tokens {
            *counts.entry(token.as_str()).or_insert(0.0) += 1.0;
        }

        let mut vector: BTreeMap<String, f64> = BTreeMap::new();
        for (term, count) in counts {
            if let Some(weight) = idf.get(term) {
                vector.insert(term.to_string(), count * weight);
            }
        }

        let norm = vector.values().map(|w| w * w).sum::<f64>().sqrt();
        if norm > 0.0 {
            for value in vector.values_mut() {
                *value /= norm;
            }
        }
        vector
    }

    fn dot(a: &BTreeMap<String, f64>, b: &BTreeMap<String, f64>) -> f64 {
        let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
        small
            .iter()
            .filter_map(|(term, weight)| large.get(term).map(|other| weight * other))
            .sum()
    }
}

impl RetrievalService for TfIdfIndex {
    fn search(&self, query: &str, k: usize) -> Vec<RetrievedChunk> {
        if self.chunks.is_empty() || k == 0 {
            return Vec::new();
        }

        let query_vector = Self::vectorize(&self.idf, &tokenize(query));
        let mut scored: Vec<(usize, f64)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(index, vector)| (index, Self::dot(&query_vector, vector)))
            .collect();

        // Ties break on (source, chunk index) so ranking is total
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| {
                    let left = &self.chunks[a.0];
                    let right = &self.chunks[b.0];
                    left.source
                        .cmp(&right.source)
                        .then(left.chunk_index.cmp(&right.chunk_index))
                })
        });

        scored
            .into_iter()
            .take(k)
            .map(|(index, score)| {
                let chunk = &self.chunks[index];
                RetrievedChunk {
                    id: chunk.id.clone(),
                    source: chunk.source.clone(),
                    chunk_index: chunk.chunk_index,
                    text: chunk.text.clone(),
                    score,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(source: &str, index: usize, text: &str) -> DocChunk {
        DocChunk {
            id: format!("{}::chunk{}", source, index),
            source: source.to_string(),
            chunk_index: index,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_relevant_chunk_ranks_first() {
        println!("🔍 Testing TF-IDF ranking...");
        let index = TfIdfIndex::build(vec![
            chunk("policy", 0, "Beverages unopened: 14 days return window"),
            chunk("policy", 1, "Refunds are issued to the original payment method"),
            chunk("calendar", 0, "Winter Classics 1997 runs in December"),
        ]);

        let results = index.search("return window for unopened Beverages", 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "policy::chunk0");
        assert!(results[0].score > results[1].score);
        println!("✅ Best chunk: {} (score {:.3})", results[0].id, results[0].score);
    }

    #[test]
    fn test_search_is_deterministic() {
        let chunks = vec![
            chunk("a", 0, "revenue by product category"),
            chunk("b", 0, "product revenue during campaigns"),
            chunk("c", 0, "customer margin definitions"),
        ];
        let index = TfIdfIndex::build(chunks.clone());
        let second = TfIdfIndex::build(chunks);

        let first_run: Vec<(String, f64)> = index
            .search("product revenue", 3)
            .into_iter()
            .map(|c| (c.id, c.score))
            .collect();
        let second_run: Vec<(String, f64)> = second
            .search("product revenue", 3)
            .into_iter()
            .map(|c| (c.id, c.score))
            .collect();
        assert_eq!(first_run, second_run);
    }

    #[test]
    fn test_empty_index_returns_nothing() {
        let index = TfIdfIndex::build(Vec::new());
        assert!(index.is_empty());
        assert!(index.search("anything", 5).is_empty());
    }

    #[test]
    fn test_unrelated_query_scores_zero() {
        let index = TfIdfIndex::build(vec![chunk("policy", 0, "Beverages unopened: 14 days")]);
        let results = index.search("quarterly payroll summary", 5);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].score, 0.0);
    }
}
