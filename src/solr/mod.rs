//! Search-index (Solr) integration: the page fetcher feeding every re-index run.

pub mod client;
/// Streaming helpers for walking a collection page by page.
pub mod pager;
pub mod types;

pub use client::SolrService;
pub use pager::{fetch_all_records, stream_pages};
pub use types::{FetchedRecords, PageResult, RawRecord, SolrError};
