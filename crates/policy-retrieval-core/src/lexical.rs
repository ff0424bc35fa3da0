//! BM25 lexical index over chunk texts.
//!
//! Tokens are lowercased runs of alphanumeric characters, so matching is
//! case-insensitive. Chunks are addressed by their ordinal in the index.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const K1: f64 = 1.2;
const B: f64 = 0.75;

/// Words dropped from queries before scoring and coverage checks.
pub const STOPWORDS: &[&str] = &[
    "a", "about", "am", "an", "and", "any", "are", "as", "at", "be", "by", "can", "could", "do",
    "does", "for", "from", "get", "have", "how", "i", "if", "in", "is", "it", "me", "my", "of",
    "on", "or", "our", "should", "so", "than", "that", "the", "their", "there", "this", "to",
    "was", "we", "what", "when", "where", "which", "who", "why", "will", "with", "would", "you",
    "your",
];

pub fn is_stopword(token: &str) -> bool {
    STOPWORDS.binary_search(&token).is_ok()
}

/// Split text into lowercase alphanumeric tokens.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Tokenize and drop stopwords, keeping first occurrences in order.
pub fn query_terms(text: &str) -> Vec<String> {
    let mut terms: Vec<String> = Vec::new();
    for token in tokenize(text) {
        if !is_stopword(&token) && !terms.contains(&token) {
            terms.push(token);
        }
    }
    terms
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LexicalIndex {
    /// term → sorted `(ordinal, term frequency)` pairs.
    postings: HashMap<String, Vec<(u32, u32)>>,
    doc_lens: Vec<u32>,
    avg_len: f64,
}

impl LexicalIndex {
    pub fn build<'a>(texts: impl IntoIterator<Item = &'a str>) -> Self {
        let mut postings: HashMap<String, Vec<(u32, u32)>> = HashMap::new();
        let mut doc_lens = Vec::new();

        for (ordinal, text) in texts.into_iter().enumerate() {
            let tokens = tokenize(text);
            doc_lens.push(tokens.len() as u32);

            let mut counts: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *counts.entry(token).or_insert(0) += 1;
            }
            for (term, tf) in counts {
                postings.entry(term).or_default().push((ordinal as u32, tf));
            }
        }

        let total: u64 = doc_lens.iter().map(|&l| l as u64).sum();
        let avg_len = if doc_lens.is_empty() {
            0.0
        } else {
            total as f64 / doc_lens.len() as f64
        };

        Self {
            postings,
            doc_lens,
            avg_len,
        }
    }

    pub fn len(&self) -> usize {
        self.doc_lens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lens.is_empty()
    }

    fn doc_freq(&self, term: &str) -> usize {
        self.postings.get(term).map(|p| p.len()).unwrap_or(0)
    }

    pub fn idf(&self, term: &str) -> f64 {
        let n = self.len() as f64;
        let df = self.doc_freq(term) as f64;
        (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
    }

    pub fn contains(&self, term: &str, ordinal: usize) -> bool {
        self.postings
            .get(term)
            .map(|p| p.binary_search_by_key(&(ordinal as u32), |&(o, _)| o).is_ok())
            .unwrap_or(false)
    }

    /// Raw BM25 scores for every chunk matching at least one term.
    ///
    /// Returned in descending score order, ties broken by ordinal.
    pub fn score(&self, terms: &[String]) -> Vec<(usize, f64)> {
        let mut scores: HashMap<u32, f64> = HashMap::new();
        for term in terms {
            let Some(list) = self.postings.get(term) else {
                continue;
            };
            let idf = self.idf(term);
            for &(ordinal, tf) in list {
                let tf = tf as f64;
                let len = self.doc_lens[ordinal as usize] as f64;
                let norm = if self.avg_len > 0.0 {
                    len / self.avg_len
                } else {
                    1.0
                };
                let s = idf * tf * (K1 + 1.0) / (tf + K1 * (1.0 - B + B * norm));
                *scores.entry(ordinal).or_insert(0.0) += s;
            }
        }

        let mut ranked: Vec<(usize, f64)> = scores
            .into_iter()
            .map(|(o, s)| (o as usize, s))
            .filter(|(_, s)| *s > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
    }

    /// IDF-weighted fraction of `terms` present in chunk `ordinal`.
    ///
    /// Terms absent from the whole index weigh as much as the rarest possible
    /// term, so a query about something the corpus never mentions keeps a
    /// low coverage everywhere.
    pub fn coverage(&self, terms: &[String], ordinal: usize) -> f64 {
        if terms.is_empty() {
            return 0.0;
        }
        let mut total = 0.0;
        let mut present = 0.0;
        for term in terms {
            let w = self.idf(term).max(f64::EPSILON);
            total += w;
            if self.contains(term, ordinal) {
                present += w;
            }
        }
        if total > 0.0 {
            present / total
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stopwords_sorted_for_binary_search() {
        let mut sorted = STOPWORDS.to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, STOPWORDS);
        assert!(is_stopword("how"));
        assert!(!is_stopword("leave"));
    }

    #[test]
    fn test_tokenize_lowercases() {
        assert_eq!(tokenize("Annual-Leave POLICY, v2"), vec!["annual", "leave", "policy", "v2"]);
    }

    #[test]
    fn test_query_terms_drop_stopwords_and_duplicates() {
        assert_eq!(query_terms("How do I apply for leave leave?"), vec!["apply", "leave"]);
    }

    #[test]
    fn test_case_insensitive_match() {
        let idx = LexicalIndex::build(["Maternity LEAVE rules", "Expense claims"]);
        let ranked = idx.score(&["leave".to_string()]);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].0, 0);
    }

    #[test]
    fn test_rare_term_outranks_common() {
        let idx = LexicalIndex::build([
            "leave policy leave",
            "policy for travel",
            "policy for expenses",
        ]);
        assert!(idx.idf("leave") > idx.idf("policy"));
        let ranked = idx.score(&["leave".to_string(), "policy".to_string()]);
        assert_eq!(ranked[0].0, 0);
    }

    #[test]
    fn test_coverage() {
        let idx = LexicalIndex::build(["apply for leave online", "leave balance"]);
        let terms = vec!["apply".to_string(), "leave".to_string()];
        assert!((idx.coverage(&terms, 0) - 1.0).abs() < 1e-9);
        let partial = idx.coverage(&terms, 1);
        assert!(partial > 0.0 && partial < 1.0);

        let missing = vec!["cryptocurrency".to_string(), "leave".to_string()];
        assert!(idx.coverage(&missing, 0) < 0.5);
    }

    #[test]
    fn test_empty_index() {
        let idx = LexicalIndex::build(std::iter::empty());
        assert!(idx.is_empty());
        assert!(idx.score(&["anything".to_string()]).is_empty());
    }
}
