//! Page-by-page iteration over a search-index collection.

use async_stream::try_stream;
use futures_core::Stream;
use futures_util::{StreamExt, pin_mut};

use super::client::SolrService;
use super::types::{FetchedRecords, PageResult, SolrError};

/// Stream the pages of a collection until `total` records have been requested.
///
/// Pages start at offset zero and advance by `page_size`. A `page_size` of zero issues a
/// single request for every record.
pub fn stream_pages<'a>(
    service: &'a SolrService,
    collection: &'a str,
    format: &'a str,
    page_size: usize,
    total: usize,
) -> impl Stream<Item = Result<PageResult, SolrError>> + 'a {
    try_stream! {
        if page_size == 0 {
            if total > 0 {
                let page = service.fetch_page(collection, format, 0, 0).await?;
                yield page;
            }
        } else {
            let mut start = 0;
            while start < total {
                let page = service.fetch_page(collection, format, start, page_size).await?;
                tracing::debug!(
                    collection,
                    start,
                    rows = page_size,
                    received = page.records.len(),
                    "Fetched search index page"
                );
                yield page;
                start += page_size;
            }
        }
    }
}

/// Probe the collection total, then gather every page into one record list.
pub async fn fetch_all_records(
    service: &SolrService,
    collection: &str,
    format: &str,
    page_size: usize,
) -> Result<FetchedRecords, SolrError> {
    let total_found = service.probe_total(collection, format).await?;
    let stream = stream_pages(service, collection, format, page_size, total_found);
    pin_mut!(stream);

    let mut fetched = FetchedRecords {
        total_found,
        records: Vec::with_capacity(total_found),
        pages: 0,
    };
    while let Some(page) = stream.next().await {
        let page = page?;
        fetched.pages += 1;
        fetched.records.extend(page.records);
    }

    if fetched.records.len() != total_found {
        tracing::warn!(
            collection,
            total_found,
            received = fetched.records.len(),
            "Search index returned a different record count than it declared"
        );
    }
    tracing::info!(
        collection,
        total_found,
        pages = fetched.pages,
        "Fetched all search index pages"
    );
    Ok(fetched)
}
