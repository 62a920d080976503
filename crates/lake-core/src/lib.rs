//! # lake-core
//!
//! Core abstractions shared by every lake component.
//!
//! This crate provides the foundational types used by the dataset engines and
//! the indexer:
//!
//! - **Keys**: Natural keys and their deterministic surrogate keys
//! - **Values**: The small typed value model rows are exchanged in
//! - **Schema Descriptors**: Code-defined dimension and fact table contracts
//! - **Store Contract**: The columnar store collaborator and its backends
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `lake-core` owns every primitive that crosses a crate boundary. Dataset
//! engines and views only talk to the store through [`store::ColumnarStore`].
//!
//! ## Example
//!
//! ```rust
//! use lake_core::prelude::*;
//!
//! let key = NaturalKey::single("10.0.0.1").unwrap();
//! let id = SurrogateKey::from_natural(&key);
//! assert_eq!(id, SurrogateKey::derive(["10.0.0.1"]).unwrap());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod key;
pub mod observability;
pub mod schema;
pub mod store;
pub mod time;
pub mod value;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::key::{NaturalKey, SurrogateKey};
    pub use crate::schema::{
        ColumnDef, DedupMode, DimensionSchema, FactSchema, PartitionGranularity, PartitionSpec,
        TableEngine, TableSpec,
    };
    pub use crate::store::{ColumnarStore, Rows, Statement, StoreConnection};
    pub use crate::value::{ColumnType, Record, Value};
}

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result};
pub use key::{NaturalKey, SurrogateKey};
pub use observability::{LogFormat, init_logging};
pub use schema::{
    ColumnDef, DedupMode, DimensionSchema, FactSchema, PartitionGranularity, PartitionSpec,
    TableEngine, TableSpec,
};
pub use store::{ColumnarStore, Rows, Statement, StoreConnection};
pub use value::{ColumnType, Record, Value};
