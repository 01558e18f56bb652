#![deny(missing_docs)]

//! Core library for the discovery re-indexer: bulk re-ingestion of a search-index collection
//! into a document-discovery backend through durable per-category job queues.

/// HTTP routing and REST handlers.
pub mod api;
/// Environment-driven configuration management.
pub mod config;
/// Discovery backend client.
pub mod discovery;
/// Structured logging and tracing setup.
pub mod logging;
/// Pipeline counters.
pub mod metrics;
/// Re-index pipeline stages and orchestration.
pub mod pipeline;
/// Named job queues and their stores.
pub mod queue;
/// Search-index client and page fetcher.
pub mod solr;
