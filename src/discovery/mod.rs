//! Discovery backend integration: document ingestion and single-document deletion.

pub mod client;
pub mod types;

pub use client::DiscoveryService;
pub use types::{DeletionResult, DiscoveryError, IngestReceipt};
