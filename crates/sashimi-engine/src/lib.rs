//! Sashimi core engine: safe filter expressions, in-memory datasets, and the
//! three-level configuration tree.
//!
//! This crate is I/O-free apart from config file load/save; discovery,
//! locking and the HTTP surface live in `sashimi-registry` and
//! `sashimi-daemon`.

pub mod config;
pub mod dataset;
pub mod error;
pub mod expr;
pub mod query;

pub use config::{Config, ConfigChain, ConfigRole};
pub use dataset::{
    deep_size, validate_dataset_name, Dataset, DeleteOutcome, SearchOutcome, UpdateOutcome,
};
pub use error::EngineError;
pub use expr::{model_from_config, CompiledExpr, EvalModel};
pub use query::SearchQuery;
