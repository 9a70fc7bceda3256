//! Ordered collection of embedding bags.
//!
//! A store holds one bag per sparse feature it owns. Each entry remembers
//! its global table index, so a shard built for one device or rank still
//! reports errors and shape information in terms of the whole model.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bag::EmbeddingBag;
use crate::error::{EmbeddingError, Result};
use crate::table::Encoding;

/// A bag together with its global table index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEntry {
    /// Position of the table in the full model.
    pub global_index: usize,
    /// The bag itself.
    pub bag: EmbeddingBag,
}

/// The embedding bags owned by one execution unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingStore {
    entries: Vec<StoreEntry>,
}

impl EmbeddingStore {
    /// Creates a store holding every table, numbered from zero.
    pub fn new(bags: Vec<EmbeddingBag>) -> Self {
        Self {
            entries: bags
                .into_iter()
                .enumerate()
                .map(|(global_index, bag)| StoreEntry { global_index, bag })
                .collect(),
        }
    }

    /// Creates a store from explicit entries, kept in the given order.
    pub fn from_entries(entries: Vec<StoreEntry>) -> Self {
        Self { entries }
    }

    /// Number of bags.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the store holds no bags.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in local order.
    pub fn entries(&self) -> &[StoreEntry] {
        &self.entries
    }

    /// Bag at local position `i`.
    pub fn bag(&self, i: usize) -> Option<&EmbeddingBag> {
        self.entries.get(i).map(|e| &e.bag)
    }

    /// Iterates the bags in local order.
    pub fn bags(&self) -> impl Iterator<Item = &EmbeddingBag> {
        self.entries.iter().map(|e| &e.bag)
    }

    /// Global table index of every entry.
    pub fn global_indices(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.global_index).collect()
    }

    /// Pooled width of every bag.
    pub fn output_widths(&self) -> Vec<usize> {
        self.bags().map(EmbeddingBag::output_width).collect()
    }

    /// Encoding tag of every bag.
    pub fn encodings(&self) -> Vec<Encoding> {
        self.bags().map(EmbeddingBag::encoding).collect()
    }

    /// Total bytes held by all weights.
    pub fn byte_size(&self) -> usize {
        self.bags().map(EmbeddingBag::byte_size).sum()
    }

    /// Returns true if every bag is a plain table and all share one row
    /// count, width and encoding, so lookups can run over one merged index
    /// space.
    pub fn is_mergeable(&self) -> bool {
        let mut plain = self.bags().map(EmbeddingBag::as_plain);
        let first = match plain.next() {
            Some(Some(t)) => t,
            Some(None) => return false,
            None => return true,
        };
        plain.all(|t| {
            t.is_some_and(|t| {
                t.rows() == first.rows()
                    && t.cols() == first.cols()
                    && t.encoding() == first.encoding()
            })
        })
    }

    /// Returns a store with every table quantized to `bits`.
    ///
    /// `32` returns an unchanged copy. The receiver is never modified, so a
    /// caller that wants to go back to full precision keeps the original.
    ///
    /// # Errors
    ///
    /// Fails with [`EmbeddingError::IncompatibleTrick`] if any bag uses a
    /// sharing trick, or with the codec's error for the first table that
    /// cannot be quantized.
    pub fn quantize(&self, bits: u32) -> Result<EmbeddingStore> {
        if bits == 32 {
            return Ok(self.clone());
        }
        if bits != 4 && bits != 8 {
            return Err(EmbeddingError::UnsupportedBitWidth { bits });
        }
        let entries = self
            .entries
            .iter()
            .map(|e| {
                Ok(StoreEntry {
                    global_index: e.global_index,
                    bag: e.bag.quantize(bits)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let store = Self { entries };
        info!(
            bits,
            tables = store.len(),
            bytes_before = self.byte_size(),
            bytes_after = store.byte_size(),
            "Quantized embedding store"
        );
        Ok(store)
    }

    /// Copies the entries at the given local positions into a new store.
    ///
    /// # Errors
    ///
    /// Returns [`EmbeddingError::Config`] if a position is out of range.
    pub fn select(&self, positions: &[usize]) -> Result<EmbeddingStore> {
        let entries = positions
            .iter()
            .map(|&p| {
                self.entries.get(p).cloned().ok_or_else(|| EmbeddingError::Config {
                    message: format!("table position {p} out of range for {} tables", self.len()),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { entries })
    }

    /// Splits the store into `parts` stores, entry `k` going to part `k % parts`.
    pub fn round_robin(&self, parts: usize) -> Vec<EmbeddingStore> {
        let mut shards = vec![EmbeddingStore::default(); parts];
        if parts == 0 {
            return shards;
        }
        for (k, entry) in self.entries.iter().enumerate() {
            shards[k % parts].entries.push(entry.clone());
        }
        shards
    }
}
