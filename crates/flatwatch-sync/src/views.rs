//! Read-only views over stored snapshots, shared by the CLI and the web surface.

use chrono::{DateTime, Utc};
use flatwatch_core::{price_min_max_series, sort_for_display, Listing, PriceEntry, SeriesPoint, SortMode};
use flatwatch_storage::{SnapshotStore, StorageError};
use serde::Serialize;

use crate::digest::listings_text;

/// One listing with its pruned history and the price envelope of similar listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingInfo {
    pub listing: Listing,
    pub history: Vec<PriceEntry>,
    /// Similar listings in the segment, the listing itself excluded.
    pub similar_count: usize,
    pub min_series: Vec<SeriesPoint>,
    pub max_series: Vec<SeriesPoint>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weekly_change_percent: Option<f64>,
}

pub async fn recent_listings(
    store: &SnapshotStore,
    slug: &str,
    mode: SortMode,
    now: DateTime<Utc>,
) -> Result<Vec<Listing>, StorageError> {
    let mut listings = store.read(slug).await?.recently_updated(now);
    sort_for_display(&mut listings, mode);
    Ok(listings)
}

/// Digest-style dump of recently updated listings; `None` when nothing is on sale.
pub async fn dump_text(
    store: &SnapshotStore,
    slug: &str,
    mode: SortMode,
    now: DateTime<Utc>,
) -> Result<Option<String>, StorageError> {
    let listings = recent_listings(store, slug, mode, now).await?;
    Ok(listings_text(&listings, mode, slug, now))
}

pub async fn listing_info(
    store: &SnapshotStore,
    slug: &str,
    id: i64,
    now: DateTime<Utc>,
) -> Result<Option<ListingInfo>, StorageError> {
    let snapshot = store.read(slug).await?;
    let Some(target) = snapshot.find(id) else {
        return Ok(None);
    };
    let similar = snapshot.similar_to(target);
    let similar_count = similar.iter().filter(|listing| listing.id != id).count();
    let (min_series, max_series) = price_min_max_series(similar);

    Ok(Some(ListingInfo {
        listing: target.clone(),
        history: target.effective_history(),
        similar_count,
        min_series,
        max_series,
        weekly_change_percent: target.weekly_price_change_percent(now),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use flatwatch_core::{FinishType, ListingStatus, Snapshot};
    use tempfile::tempdir;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 20, 12, 0, 0).single().unwrap()
    }

    fn stored(id: i64, price: i64, area: f64, updated_minutes_ago: i64) -> Listing {
        let updated = now() - Duration::minutes(updated_minutes_ago);
        Listing {
            id,
            price,
            area,
            rooms: 2,
            status: ListingStatus::Reserved,
            finish_type: FinishType::WhiteBox,
            block_slug: "2ngt".into(),
            block_name: "Second Nagatinsky".into(),
            bulk_name: "Building 3".into(),
            average_price: 300_000,
            updated: Some(updated),
            created: Some(updated),
            price_history: vec![
                PriceEntry {
                    date: now() - Duration::days(10),
                    price: price + 500_000,
                    status: Some(ListingStatus::Reserved),
                },
                PriceEntry {
                    date: updated,
                    price,
                    status: Some(ListingStatus::Reserved),
                },
            ],
            ..Default::default()
        }
    }

    async fn seeded() -> (tempfile::TempDir, SnapshotStore) {
        let dir = tempdir().unwrap();
        let store = SnapshotStore::new(dir.path(), "test");
        let snapshot = Snapshot {
            flats: vec![
                stored(1, 15_000_000, 50.0, 5),
                stored(2, 14_000_000, 50.5, 10),
                stored(3, 9_000_000, 30.0, 5),
                stored(4, 13_000_000, 50.0, 600),
            ],
            last_page: 1,
        };
        store.write("2ngt", &snapshot).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn recent_listings_skip_stale_and_sort() {
        let (_dir, store) = seeded().await;
        let by_price = recent_listings(&store, "2ngt", SortMode::Price, now()).await.unwrap();
        assert_eq!(by_price.iter().map(|l| l.id).collect::<Vec<_>>(), vec![3, 2, 1]);

        let by_avg = recent_listings(&store, "2ngt", SortMode::BelowAverage, now()).await.unwrap();
        assert_eq!(by_avg.iter().map(|l| l.id).collect::<Vec<_>>(), vec![2, 1, 3]);

        let text = dump_text(&store, "2ngt", SortMode::Price, now()).await.unwrap().unwrap();
        assert!(text.starts_with("3 flats on sale in Second Nagatinsky:"));
        assert!(dump_text(&store, "empty", SortMode::Price, now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn listing_info_collects_similar_envelope() {
        let (_dir, store) = seeded().await;
        let info = listing_info(&store, "2ngt", 1, now()).await.unwrap().unwrap();
        assert_eq!(info.listing.id, 1);
        assert_eq!(info.history.len(), 2);
        assert_eq!(info.similar_count, 2);
        assert!(!info.min_series.is_empty());
        assert!(info.min_series.iter().all(|p| p.price <= info.max_series[0].price));
        assert!(info.weekly_change_percent.is_some_and(|change| change < 0.0));

        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("similarCount").is_some());
        assert!(json.get("minSeries").is_some());

        assert!(listing_info(&store, "2ngt", 999, now()).await.unwrap().is_none());
    }
}
