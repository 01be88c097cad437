//! A segmented inverted-index storage engine over an ordered key/value
//! store.
//!
//! See [`database::Database`] for the top-level handle, [`backend`] for the
//! capability trait a real KV store must implement, and [`deferred`] for
//! the append-only bulk-load path.

pub mod backend;
pub mod config;
pub mod control;
pub mod cursor;
pub mod database;
pub mod deferred;
pub mod ebm;
pub mod error;
pub mod index_table;
pub mod primary;
pub mod recordset;
pub mod segment;
pub mod segment_table;

pub use database::Database;
pub use error::{Error, Result};
