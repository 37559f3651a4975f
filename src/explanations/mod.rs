// SPDX-License-Identifier: MIT OR Apache-2.0

//! Human-readable SAE feature explanations, cached on disk.
//!
//! [`load_or_fetch`] is the only entry point sessions use: it reads the
//! cache artifact when one exists and otherwise fetches the export once,
//! persists it, and returns it.  A written cache is never refreshed.
//! [`ExplanationTable::search`] and [`ExplanationTable::random`] browse the
//! loaded table without touching the network.

pub mod neuronpedia;
pub mod search;
pub mod store;

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{info, warn};

use crate::error::{InterpError, Result};

pub use self::neuronpedia::NeuronpediaClient;
pub use self::search::SearchFeature;
pub use self::store::{ExplanationStore, FileStore};

// ---------------------------------------------------------------------------
// ExplanationRecord
// ---------------------------------------------------------------------------

/// One explanation row of an SAE feature export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplanationRecord {
    /// SAE latent index; exports send it as a string, it is stored as an integer.
    #[serde(deserialize_with = "index_from_int_or_str")]
    pub index: u32,
    /// Explanation text.
    #[serde(default, deserialize_with = "null_as_empty")]
    pub description: String,
    /// Model the SAE belongs to, e.g. `gemma-2-2b`.
    #[serde(default)]
    pub model_id: Option<String>,
    /// SAE id within the model, e.g. `0-gemmascope-res-16k`.
    #[serde(default)]
    pub layer: Option<String>,
    /// Model that wrote the explanation.
    #[serde(default)]
    pub explanation_model_name: Option<String>,
    /// Explanation method.
    #[serde(default)]
    pub type_name: Option<String>,
}

impl ExplanationRecord {
    /// A record with only `index` and `description` set.
    #[must_use]
    pub fn new(index: u32, description: impl Into<String>) -> Self {
        Self {
            index,
            description: description.into(),
            model_id: None,
            layer: None,
            explanation_model_name: None,
            type_name: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawIndex {
    Int(u64),
    Str(String),
}

fn index_from_int_or_str<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u32, D::Error> {
    use serde::de::Error;

    match RawIndex::deserialize(deserializer)? {
        RawIndex::Int(i) => u32::try_from(i).map_err(D::Error::custom),
        RawIndex::Str(s) => s
            .trim()
            .parse::<u32>()
            .map_err(|e| D::Error::custom(format!("index `{s}`: {e}"))),
    }
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

// ---------------------------------------------------------------------------
// ExplanationTable
// ---------------------------------------------------------------------------

/// Explanation rows keyed by feature index.
///
/// A feature may carry several explanations; rows keep export order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExplanationTable {
    rows: Vec<ExplanationRecord>,
    by_index: HashMap<u32, Vec<usize>>,
}

impl ExplanationTable {
    /// Build a table from rows in export order.
    #[must_use]
    pub fn from_records(rows: Vec<ExplanationRecord>) -> Self {
        let mut by_index: HashMap<u32, Vec<usize>> = HashMap::new();
        for (pos, row) in rows.iter().enumerate() {
            by_index.entry(row.index).or_default().push(pos);
        }
        Self { rows, by_index }
    }

    /// First explanation for `index`.
    #[must_use]
    pub fn get(&self, index: u32) -> Option<&ExplanationRecord> {
        self.all(index).next()
    }

    /// Every explanation for `index`, in export order.
    pub fn all(&self, index: u32) -> impl Iterator<Item = &ExplanationRecord> {
        self.by_index
            .get(&index)
            .into_iter()
            .flatten()
            .filter_map(|&pos| self.rows.get(pos))
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows in export order.
    pub fn iter(&self) -> impl Iterator<Item = &ExplanationRecord> {
        self.rows.iter()
    }

    /// Rows in export order, as a slice.
    #[must_use]
    pub fn records(&self) -> &[ExplanationRecord] {
        &self.rows
    }
}

impl Serialize for ExplanationTable {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.rows.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ExplanationTable {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Vec::<ExplanationRecord>::deserialize(deserializer).map(Self::from_records)
    }
}

// ---------------------------------------------------------------------------
// Source + cache-or-fetch
// ---------------------------------------------------------------------------

/// Remote provider of an SAE's explanation export.
pub trait ExplanationSource {
    /// Fetch every explanation row for `sae_id` of `model_id`.
    ///
    /// # Errors
    ///
    /// Returns [`InterpError::ExternalFetchFailed`] on transport, status,
    /// or decoding failure.
    fn fetch(&self, model_id: &str, sae_id: &str) -> Result<Vec<ExplanationRecord>>;
}

/// Split a Neuronpedia id `<model>/<sae>` into its two parts.
///
/// # Errors
///
/// Returns [`InterpError::Config`] if either part is missing.
pub fn split_neuronpedia_id(neuronpedia_id: &str) -> Result<(&str, &str)> {
    match neuronpedia_id.split_once('/') {
        Some((model, sae)) if !model.is_empty() && !sae.is_empty() => Ok((model, sae)),
        _ => Err(InterpError::Config(format!(
            "neuronpedia id `{neuronpedia_id}` is not `<model>/<sae>`"
        ))),
    }
}

/// Return the cached explanation table, fetching and caching it if absent.
///
/// With an existing artifact this performs no fetch.  Otherwise it fetches
/// exactly once and saves exactly once.  A cache that exists but cannot be
/// decoded is an error, never a silent refetch.
///
/// # Errors
///
/// Returns [`InterpError::Config`] for a malformed `neuronpedia_id`,
/// [`InterpError::ExternalFetchFailed`] if the fetch fails, and
/// [`InterpError::Cache`] / [`InterpError::Io`] for store failures.
pub fn load_or_fetch<S, F>(store: &S, source: &F, neuronpedia_id: &str) -> Result<ExplanationTable>
where
    S: ExplanationStore + ?Sized,
    F: ExplanationSource + ?Sized,
{
    if store.exists() {
        let table = store.load()?;
        info!(rows = table.len(), "explanations cache hit");
        return Ok(table);
    }

    let (model_id, sae_id) = split_neuronpedia_id(neuronpedia_id)?;
    warn!(model_id, sae_id, "explanations cache miss, fetching export");
    let table = ExplanationTable::from_records(source.fetch(model_id, sae_id)?);
    store.save(&table)?;
    info!(rows = table.len(), "explanations cached");
    Ok(table)
}
