//! Listing source contracts + the paginated filter-API implementation.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use flatwatch_core::{annotate_bucket_averages, dedup_by_id, Listing};
use flatwatch_storage::{FetchError, HttpFetcher};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "flatwatch-adapters";

pub const DEFAULT_FILTER_API_BASE_URL: &str = "https://flat.pik-service.ru/api/v1/filter/flat-by-block";

const FILTER_QUERY: &str = "type=1,2&location=2,3&sortBy=price&orderBy=asc&onlyFlats=1&flatLimit=16";
const PAGE_PARAM: &str = "flatPage";

/// Identity of one tracked segment: upstream numeric id plus local slug.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentRef {
    pub id: i64,
    pub slug: String,
}

/// One decoded upstream page.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub items: Vec<Listing>,
    pub last_page: u32,
    pub count: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchStats {
    pub pages_fetched: u32,
    pub last_page: u32,
    pub reported_count: Option<i64>,
    pub downloaded: usize,
    pub unique_ids: usize,
}

#[derive(Debug, Clone)]
pub struct FetchedBatch {
    pub segment: SegmentRef,
    /// Deduplicated listings annotated with bucket averages.
    pub listings: Vec<Listing>,
    pub last_page: u32,
    pub stats: FetchStats,
}

#[derive(Debug)]
pub enum ZeroResultsDiagnostic {
    Response {
        status: u16,
        content_type: String,
        snippet: String,
    },
    RefetchFailed(FetchError),
}

impl fmt::Display for ZeroResultsDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Response {
                status,
                content_type,
                snippet,
            } => write!(f, "status {status}, content-type {content_type:?}, body: {snippet}"),
            Self::RefetchFailed(err) => write!(f, "re-fetch of page 1 failed: {err}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("decoding page from {url} (content-type {content_type:?}): {source}; body: {snippet}")]
    Unmarshal {
        url: String,
        content_type: String,
        snippet: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("zero listings for {url} (last page {last_page}): {diagnostic}")]
    ZeroResults {
        url: String,
        last_page: u32,
        diagnostic: ZeroResultsDiagnostic,
    },
    #[error("fetching page {page}: {source}")]
    Page {
        page: u32,
        #[source]
        source: Box<SourceError>,
    },
}

impl SourceError {
    /// Innermost error, skipping page wrappers.
    pub fn root(&self) -> &SourceError {
        match self {
            Self::Page { source, .. } => source.root(),
            other => other,
        }
    }
}

#[async_trait]
pub trait ListingSource: Send + Sync {
    fn source_id(&self) -> &'static str;

    async fn fetch_segment(&self, segment: &SegmentRef) -> Result<FetchedBatch, SourceError>;
}

#[derive(Debug, Default, Deserialize)]
struct PageBody {
    #[serde(default)]
    data: Option<PageData>,
}

#[derive(Debug, Default, Deserialize)]
struct PageData {
    #[serde(default)]
    items: Option<Vec<Listing>>,
    #[serde(default)]
    stats: Option<PageStats>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageStats {
    #[serde(default)]
    last_page: Option<u32>,
    #[serde(default)]
    count: Option<i64>,
}

pub fn parse_page(body: &[u8]) -> Result<ListingPage, serde_json::Error> {
    let decoded: PageBody = serde_json::from_slice(body)?;
    let data = decoded.data.unwrap_or_default();
    let stats = data.stats.unwrap_or_default();
    Ok(ListingPage {
        items: data.items.unwrap_or_default(),
        last_page: stats.last_page.unwrap_or_default(),
        count: stats.count,
    })
}

/// Upstream filter endpoint, one paginated GET sequence per segment.
#[derive(Debug, Clone)]
pub struct FilterApiSource {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl FilterApiSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn page_url(&self, segment_id: i64, page: u32) -> String {
        format!(
            "{}/{segment_id}?{FILTER_QUERY}&{PAGE_PARAM}={page}",
            self.base_url
        )
    }

    async fn fetch_page(&self, segment: &SegmentRef, page: u32) -> Result<ListingPage, SourceError> {
        let url = self.page_url(segment.id, page);
        let response = self
            .http
            .get_with_flap_retries(&url, Some(segment.id))
            .await?;
        parse_page(&response.body).map_err(|source| SourceError::Unmarshal {
            snippet: response.snippet(),
            content_type: response.content_type.clone(),
            url,
            source,
        })
    }

    async fn zero_results(&self, segment: &SegmentRef, last_page: u32) -> SourceError {
        let url = self.page_url(segment.id, 1);
        let diagnostic = match self.http.get(&url).await {
            Ok(response) => ZeroResultsDiagnostic::Response {
                status: response.status.as_u16(),
                snippet: response.snippet(),
                content_type: response.content_type,
            },
            Err(err) => ZeroResultsDiagnostic::RefetchFailed(err),
        };
        SourceError::ZeroResults {
            url,
            last_page,
            diagnostic,
        }
    }

    async fn fetch_all_pages(&self, segment: &SegmentRef) -> Result<FetchedBatch, SourceError> {
        let first = self
            .fetch_page(segment, 1)
            .await
            .map_err(|err| SourceError::Page {
                page: 1,
                source: Box::new(err),
            })?;

        let last_page = first.last_page;
        let reported_count = first.count;
        let mut items = first.items;
        let mut pages_fetched = 1;

        for page in 2..=last_page {
            let next = self
                .fetch_page(segment, page)
                .await
                .map_err(|err| SourceError::Page {
                    page,
                    source: Box::new(err),
                })?;
            items.extend(next.items);
            pages_fetched += 1;
        }

        let downloaded = items.len();
        let mut listings = dedup_by_id(items);
        if listings.is_empty() {
            return Err(self.zero_results(segment, last_page).await);
        }
        annotate_bucket_averages(&mut listings);

        let stats = FetchStats {
            pages_fetched,
            last_page,
            reported_count,
            downloaded,
            unique_ids: listings.len(),
        };
        debug!(?stats, "segment pages fetched");

        Ok(FetchedBatch {
            segment: segment.clone(),
            listings,
            last_page,
            stats,
        })
    }
}

#[async_trait]
impl ListingSource for FilterApiSource {
    fn source_id(&self) -> &'static str {
        "filter-api"
    }

    async fn fetch_segment(&self, segment: &SegmentRef) -> Result<FetchedBatch, SourceError> {
        let span = info_span!("fetch_segment", segment = %segment.slug, segment_id = segment.id);
        self.fetch_all_pages(segment).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use axum::extract::{Path, Query, State};
    use axum::http::{header, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use axum::Router;
    use flatwatch_core::FinishType;
    use flatwatch_storage::{FlapPolicy, HttpClientConfig};
    use serde_json::json;

    fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn fixture_page() -> Vec<u8> {
        std::fs::read(
            workspace_root()
                .join("fixtures")
                .join("filter-api")
                .join("block-42-page-1.json"),
        )
        .unwrap()
    }

    fn item(id: i64, price: i64) -> serde_json::Value {
        json!({
            "id": id, "area": 40.0, "rooms": 1, "price": price, "status": "free",
            "blockSlug": "2ngt", "blockName": "Second Nagatinsky", "finishType": 1
        })
    }

    #[derive(Clone)]
    struct Upstream {
        last_page: u32,
        failing_page: Option<u32>,
        empty: bool,
        hits: Arc<AtomicUsize>,
    }

    async fn filter_endpoint(
        State(upstream): State<Upstream>,
        Path(block): Path<i64>,
        Query(query): Query<HashMap<String, String>>,
    ) -> Response {
        upstream.hits.fetch_add(1, Ordering::SeqCst);
        let page: u32 = query
            .get("flatPage")
            .and_then(|p| p.parse().ok())
            .unwrap_or(1);
        if upstream.failing_page == Some(page) {
            return (StatusCode::BAD_GATEWAY, "bad gateway").into_response();
        }
        let items = if upstream.empty {
            vec![]
        } else {
            vec![item(i64::from(page) * 10, 5_000_000), item(i64::from(page) * 10 + 1, 6_000_000), item(10, 1)]
        };
        let body = json!({
            "data": {
                "items": items,
                "stats": {"lastPage": upstream.last_page, "count": 99, "blocks": [block], "countBlocks": 1}
            }
        });
        ([(header::CONTENT_TYPE, "application/json")], body.to_string()).into_response()
    }

    async fn source_for(upstream: Upstream) -> FilterApiSource {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = Router::new()
            .route("/api/{block}", get(filter_endpoint))
            .with_state(upstream);
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            flap: FlapPolicy {
                max_attempts: 2,
                delay: Duration::from_millis(1),
            },
            ..HttpClientConfig::default()
        })
        .unwrap();
        FilterApiSource::new(Arc::new(http), format!("http://{addr}/api/"))
    }

    fn segment() -> SegmentRef {
        SegmentRef {
            id: 42,
            slug: "2ngt".into(),
        }
    }

    fn upstream(last_page: u32) -> Upstream {
        Upstream {
            last_page,
            failing_page: None,
            empty: false,
            hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[test]
    fn fixture_page_decodes_items_and_stats() {
        let page = parse_page(&fixture_page()).unwrap();
        assert_eq!(page.items.len(), 4);
        assert_eq!(page.last_page, 1);
        assert_eq!(page.count, Some(3));

        let whitebox = &page.items[2];
        assert_eq!(whitebox.finish_type, FinishType::WhiteBox);
        assert!(whitebox.metro.name.is_empty());

        let mut listings = dedup_by_id(page.items);
        annotate_bucket_averages(&mut listings);
        let averages: Vec<i64> = listings.iter().map(|l| l.average_price).collect();
        assert_eq!(averages, vec![240_000, 240_000, 300_000]);
    }

    #[test]
    fn null_data_decodes_as_empty_page() {
        let page = parse_page(br#"{"data":{"items":null,"stats":null}}"#).unwrap();
        assert!(page.items.is_empty());
        assert_eq!(page.last_page, 0);
        assert!(parse_page(b"[1,2").is_err());
    }

    #[test]
    fn page_urls_carry_filter_and_page_flag() {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        let source = FilterApiSource::new(http, DEFAULT_FILTER_API_BASE_URL);
        assert_eq!(
            source.page_url(1240, 3),
            "https://flat.pik-service.ru/api/v1/filter/flat-by-block/1240?type=1,2&location=2,3\
             &sortBy=price&orderBy=asc&onlyFlats=1&flatLimit=16&flatPage=3"
        );
    }

    #[tokio::test]
    async fn all_pages_are_fetched_deduplicated_and_annotated() {
        let upstream = upstream(3);
        let hits = upstream.hits.clone();
        let source = source_for(upstream).await;

        let batch = source.fetch_segment(&segment()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(batch.last_page, 3);
        assert_eq!(
            batch.stats,
            FetchStats {
                pages_fetched: 3,
                last_page: 3,
                reported_count: Some(99),
                downloaded: 9,
                unique_ids: 6,
            }
        );
        let ids: Vec<i64> = batch.listings.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![10, 11, 20, 21, 30, 31]);
        assert!(batch.listings.iter().all(|l| l.average_price > 0));
    }

    #[tokio::test]
    async fn failing_page_fails_the_whole_segment() {
        let mut upstream = upstream(3);
        upstream.failing_page = Some(2);
        let source = source_for(upstream).await;

        let err = source.fetch_segment(&segment()).await.unwrap_err();
        match &err {
            SourceError::Page { page, .. } => assert_eq!(*page, 2),
            other => panic!("unexpected error: {other}"),
        }
        assert!(matches!(
            err.root(),
            SourceError::Fetch(FetchError::HttpStatus { status: 502, .. })
        ));
    }

    #[tokio::test]
    async fn empty_segment_reports_zero_results_with_refetch_diagnostics() {
        let mut upstream = upstream(0);
        upstream.empty = true;
        let hits = upstream.hits.clone();
        let source = source_for(upstream).await;

        let err = source.fetch_segment(&segment()).await.unwrap_err();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        match err {
            SourceError::ZeroResults {
                last_page,
                diagnostic: ZeroResultsDiagnostic::Response { status, content_type, .. },
                ..
            } => {
                assert_eq!(last_page, 0);
                assert_eq!(status, 200);
                assert_eq!(content_type, "application/json");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
