//! MediaVault: a local web front-end around an external media extractor.
//!
//! The crate owns the life of downloaded files: it names them, keeps them in
//! one flat store directory, serves them back, and deletes them on a timer or
//! on the next startup sweep.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod expiry;
pub mod ident;
pub mod retrieval;
pub mod sanitize;
pub mod store;

pub use error::{Error, Result};
