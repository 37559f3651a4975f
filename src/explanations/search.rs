// SPDX-License-Identifier: MIT OR Apache-2.0

//! Local lookup over the explanation table: ranked keyword search and
//! seeded random browsing.
//!
//! Relevance is the fraction of distinct query terms found among a
//! description's terms, so it lies in `(0, 1]` for every returned hit.
//! Terms are lowercased alphanumeric runs.

use std::collections::{HashMap, HashSet};

use rand::Rng;
use rand::seq::SliceRandom;
use serde::Serialize;

use super::{ExplanationRecord, ExplanationTable};

/// A feature matched by search or drawn by browsing.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchFeature {
    /// SAE latent index.
    pub feature_idx: u32,
    /// Share of query terms the description contains; `0.0` for browsed features.
    pub relevance_score: f32,
    /// The explanation text that matched.
    pub description: String,
}

impl SearchFeature {
    fn browsed(record: &ExplanationRecord) -> Self {
        Self {
            feature_idx: record.index,
            relevance_score: 0.0,
            description: record.description.clone(),
        }
    }
}

/// Lowercased alphanumeric runs of `text`.
fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

impl ExplanationTable {
    /// The `top_k` features whose explanations best match `query`.
    ///
    /// Each feature appears once, with its best-scoring explanation.
    /// Results are ordered by descending relevance, ties by ascending
    /// feature index.  A query with no terms matches nothing.
    #[must_use]
    pub fn search(&self, query: &str, top_k: usize) -> Vec<SearchFeature> {
        let wanted: HashSet<String> = terms(query).collect();
        if wanted.is_empty() || top_k == 0 {
            return Vec::new();
        }

        #[allow(clippy::cast_precision_loss)]
        let total = wanted.len() as f32;
        let mut best: HashMap<u32, SearchFeature> = HashMap::new();
        for record in self.iter() {
            let found: HashSet<String> = terms(&record.description)
                .filter(|t| wanted.contains(t))
                .collect();
            if found.is_empty() {
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let score = found.len() as f32 / total;
            let better = best
                .get(&record.index)
                .is_none_or(|hit| score > hit.relevance_score);
            if better {
                best.insert(
                    record.index,
                    SearchFeature {
                        feature_idx: record.index,
                        relevance_score: score,
                        description: record.description.clone(),
                    },
                );
            }
        }

        let mut hits: Vec<SearchFeature> = best.into_values().collect();
        hits.sort_by(|a, b| {
            b.relevance_score
                .total_cmp(&a.relevance_score)
                .then(a.feature_idx.cmp(&b.feature_idx))
        });
        hits.truncate(top_k);
        hits
    }

    /// Up to `count` distinct features drawn uniformly with `rng`.
    ///
    /// Each feature is represented by its first explanation.  Asking for
    /// more features than the table holds returns all of them.
    pub fn random<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Vec<SearchFeature> {
        let mut seen = HashSet::new();
        let distinct: Vec<&ExplanationRecord> =
            self.iter().filter(|r| seen.insert(r.index)).collect();
        distinct
            .choose_multiple(rng, count)
            .map(|r| SearchFeature::browsed(r))
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::indexing_slicing)]
mod tests {
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    use super::*;

    fn table() -> ExplanationTable {
        ExplanationTable::from_records(vec![
            ExplanationRecord::new(10, "references to foxes and wolves"),
            ExplanationRecord::new(3, "Foxes"),
            ExplanationRecord::new(7, "numbers in tables"),
            ExplanationRecord::new(3, "animals: foxes, wolves"),
            ExplanationRecord::new(12, "the word 'fox' in code"),
        ])
    }

    #[test]
    fn search_ranks_by_matched_terms() {
        let hits = table().search("foxes wolves", 10);
        let ids: Vec<u32> = hits.iter().map(|h| h.feature_idx).collect();
        assert_eq!(ids, vec![3, 10]);
        assert_eq!(hits[0].relevance_score, 1.0);
        assert_eq!(hits[1].relevance_score, 1.0);
    }

    #[test]
    fn search_keeps_best_row_per_feature() {
        let hits = table().search("Wolves, foxes!", 10);
        let three = hits.iter().find(|h| h.feature_idx == 3).unwrap();
        assert_eq!(three.description, "animals: foxes, wolves");
        assert_eq!(hits.iter().filter(|h| h.feature_idx == 3).count(), 1);
    }

    #[test]
    fn partial_match_scores_lower() {
        let hits = table().search("foxes tables", 10);
        assert_eq!(hits.len(), 3);
        assert!(hits.iter().all(|h| h.relevance_score == 0.5));
        let ids: Vec<u32> = hits.iter().map(|h| h.feature_idx).collect();
        assert_eq!(ids, vec![3, 7, 10]);
    }

    #[test]
    fn search_is_case_insensitive_and_truncates() {
        let hits = table().search("FOXES", 1);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].feature_idx, 3);
    }

    #[test]
    fn empty_query_matches_nothing() {
        assert!(table().search("  ,. ", 5).is_empty());
        assert!(table().search("foxes", 0).is_empty());
        assert!(table().search("zebra", 5).is_empty());
    }

    #[test]
    fn random_draws_distinct_features_reproducibly() {
        let table = table();
        let a = table.random(3, &mut StdRng::seed_from_u64(4));
        let b = table.random(3, &mut StdRng::seed_from_u64(4));
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        let unique: HashSet<u32> = a.iter().map(|f| f.feature_idx).collect();
        assert_eq!(unique.len(), 3);
        assert!(a.iter().all(|f| f.relevance_score == 0.0));
    }

    #[test]
    fn random_caps_at_table_size() {
        let all = table().random(50, &mut StdRng::seed_from_u64(0));
        let mut ids: Vec<u32> = all.iter().map(|f| f.feature_idx).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![3, 7, 10, 12]);
        let three = all.iter().find(|f| f.feature_idx == 3).unwrap();
        assert_eq!(three.description, "Foxes");
    }
}
