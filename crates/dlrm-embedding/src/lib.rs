//! Embedding storage and batched lookup for DLRM inference.
//!
//! # Overview
//!
//! The main components are:
//!
//! - [`EmbeddingTable`] - a `rows x cols` table in full precision or
//!   row-wise quantized to 8 or 4 bits
//! - [`codec`] - the row-wise affine quantization codec
//! - [`EmbeddingBag`] - a plain table or one of the memory-saving
//!   quotient-remainder and mixed-dimension variants
//! - [`EmbeddingStore`] - the bags owned by one execution unit
//! - [`SparseBatch`] - per-table index and offset lists of one batch
//! - [`BatchedLookupEngine`] - sum-pooled lookup of a batch against a store
//!
//! # Example
//!
//! ```
//! use dlrm_embedding::prelude::*;
//!
//! let store = EmbeddingStore::new(vec![
//!     EmbeddingBag::Plain(UniformTableInit.init_table(5, 4, 1)),
//!     EmbeddingBag::Plain(UniformTableInit.init_table(5, 4, 2)),
//! ]);
//! let batch = SparseBatch::fixed(vec![vec![0, 1, 2, 3], vec![4, 4, 0, 1]], 2).unwrap();
//!
//! let pooled = BatchedLookupEngine::new().lookup(&store, &batch).unwrap();
//! assert_eq!(pooled.len(), 2);
//! assert_eq!(pooled[0].shape(), &[2, 4]);
//!
//! // Quantization returns a new store and leaves the original intact.
//! let int4 = store.quantize(4).unwrap();
//! assert_eq!(int4.encodings(), vec![Encoding::Int4, Encoding::Int4]);
//! ```

#![warn(missing_docs)]

pub mod bag;
pub mod batch;
pub mod codec;
mod error;
pub mod initializer;
pub mod lookup;
pub mod mixed_dim;
pub mod store;
pub mod table;

pub use bag::{EmbeddingBag, MdBag, QrBag, QrOperation};
pub use batch::SparseBatch;
pub use codec::{dequantize_row, quantize, row_scale, Int4RowCodec, Int8RowCodec, RowCodec};
pub use error::{EmbeddingError, Result};
pub use initializer::{
    table_seeds, ConstantTableInit, RowIndexInit, TableInitializer, UniformTableInit,
};
pub use lookup::BatchedLookupEngine;
pub use mixed_dim::md_solver;
pub use store::{EmbeddingStore, StoreEntry};
pub use table::{EmbeddingTable, Encoding, TableStorage};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bag::{EmbeddingBag, QrOperation};
    pub use crate::batch::SparseBatch;
    pub use crate::error::{EmbeddingError, Result};
    pub use crate::initializer::{TableInitializer, UniformTableInit};
    pub use crate::lookup::BatchedLookupEngine;
    pub use crate::store::EmbeddingStore;
    pub use crate::table::{EmbeddingTable, Encoding};
}
