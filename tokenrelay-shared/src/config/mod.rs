//! # Configuration
//!
//! Configuration structures and loading for the delivery engine, the ingest bridge and
//! the origin proxy.

/// Process configuration and its loader.
pub mod server;
