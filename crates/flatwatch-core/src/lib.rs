//! Core domain model and pure listing algorithms for flatwatch.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Deserializer, Serialize};

pub const CRATE_NAME: &str = "flatwatch-core";

/// A listing counts as "currently on sale" when it was observed this recently.
pub const RECENTLY_UPDATED_MINUTES: i64 = 60;
/// Weekly price change compares against the latest history entry older than this.
pub const PRICE_COMPARISON_DAYS: i64 = 7;
pub const PRICE_CHANGE_EPSILON_PERCENT: f64 = 0.05;
pub const SIMILAR_AREA_PERCENT: f64 = 2.0;
pub const HISTORY_COLLAPSE_MINUTES: i64 = 60;
pub const SERIES_WINDOW_DAYS: i64 = 14;
pub const SERIES_COLLAPSE_HOURS: i64 = 24;

/// History entries before 2023-01-01T00:00:00Z are backfill placeholders and get discarded.
const HISTORY_EPOCH_SECS: i64 = 1_672_531_200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Free,
    #[serde(rename = "reserve", alias = "reserved")]
    Reserved,
    Sold,
    #[default]
    #[serde(other)]
    Other,
}

impl ListingStatus {
    pub fn from_wire(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "free" => Self::Free,
            "reserve" | "reserved" => Self::Reserved,
            "sold" => Self::Sold,
            _ => Self::Other,
        }
    }
}

/// Upstream encodes finish type as a small integer: 1 finished, 2 white box, anything else none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "i8", into = "i8")]
pub enum FinishType {
    #[default]
    None,
    Finished,
    WhiteBox,
}

impl From<i8> for FinishType {
    fn from(value: i8) -> Self {
        match value {
            1 => Self::Finished,
            2 => Self::WhiteBox,
            _ => Self::None,
        }
    }
}

impl From<FinishType> for i8 {
    fn from(value: FinishType) -> Self {
        match value {
            FinishType::None => 0,
            FinishType::Finished => 1,
            FinishType::WhiteBox => 2,
        }
    }
}

impl FinishType {
    pub fn label(self) -> &'static str {
        match self {
            Self::None => "no finish",
            Self::Finished => "finished",
            Self::WhiteBox => "whitebox",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Metro {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub color: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PriceEntry {
    pub date: DateTime<Utc>,
    pub price: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<ListingStatus>,
}

/// One listing as returned by the filter API and as persisted in a segment snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Listing {
    pub id: i64,
    pub area: f64,
    pub floor: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub metro: Metro,
    pub price: i64,
    pub rooms: i8,
    pub status: ListingStatus,
    #[serde(deserialize_with = "null_as_default")]
    pub plan_url: String,
    #[serde(deserialize_with = "null_as_default")]
    pub bulk_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub max_floor: i32,
    #[serde(deserialize_with = "null_as_default")]
    pub block_name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub block_slug: String,
    pub finish_type: FinishType,
    #[serde(deserialize_with = "null_as_default")]
    pub settlement_date: String,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_lenient_time"
    )]
    pub created: Option<DateTime<Utc>>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_lenient_time"
    )]
    pub updated: Option<DateTime<Utc>>,
    pub average_price: i64,
    pub old_price: i64,
    #[serde(
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "deserialize_history"
    )]
    pub price_history: Vec<PriceEntry>,
}

impl Listing {
    /// Signed percentage change against the previous-cycle price, 0 when unknown.
    pub fn price_drop_percent(&self) -> f64 {
        if self.old_price == 0 {
            return 0.0;
        }
        (self.price as f64 / self.old_price as f64 - 1.0) * 100.0
    }

    /// Signed percentage of this listing's unit price against its bucket average.
    pub fn below_average_percent(&self) -> f64 {
        if self.area == 0.0 || self.average_price == 0 {
            return 0.0;
        }
        (self.price as f64 / self.area / self.average_price as f64 - 1.0) * 100.0
    }

    pub fn is_similar(&self, other: &Listing) -> bool {
        if self.rooms != other.rooms || self.finish_type != other.finish_type {
            return false;
        }
        let upper = other.area / 100.0 * (100.0 + SIMILAR_AREA_PERCENT);
        let lower = other.area / 100.0 * (100.0 - SIMILAR_AREA_PERCENT);
        self.area <= upper && self.area >= lower
    }

    pub fn recently_updated(&self, now: DateTime<Utc>) -> bool {
        self.updated
            .is_some_and(|updated| now - updated < Duration::minutes(RECENTLY_UPDATED_MINUTES))
    }

    /// History as shown to readers: seeded from the current observation when empty, the
    /// latest entry inheriting the current status when it has none, then pruned.
    pub fn effective_history(&self) -> Vec<PriceEntry> {
        let mut history = self.price_history.clone();
        if history.is_empty() {
            let Some(updated) = self.updated else {
                return history;
            };
            history.push(PriceEntry {
                date: updated,
                price: self.price,
                status: Some(self.status),
            });
        }
        if let Some(last) = history.last_mut() {
            if last.status.is_none() {
                last.status = Some(self.status);
            }
        }
        prune_price_history(history)
    }

    /// Percentage change against the latest known price older than a week.
    pub fn weekly_price_change_percent(&self, now: DateTime<Utc>) -> Option<f64> {
        let week_ago = now - Duration::days(PRICE_COMPARISON_DAYS);
        let old_price = self
            .effective_history()
            .iter()
            .filter(|entry| entry.date < week_ago)
            .last()
            .map(|entry| entry.price)
            .filter(|price| *price != 0)?;
        let percent = (self.price as f64 / old_price as f64 - 1.0) * 100.0;
        (percent.abs() > PRICE_CHANGE_EPSILON_PERCENT).then_some(percent)
    }
}

/// Exact integer check that `new` is at least `threshold_percent` below `old`.
pub fn price_drop_reaches(old: i64, new: i64, threshold_percent: u8) -> bool {
    if old <= 0 {
        return false;
    }
    let drop = i128::from(old) - i128::from(new);
    drop * 100 >= i128::from(threshold_percent) * i128::from(old)
}

/// Sorts by date and collapses `A -> ... -> A` runs that return to a price within the
/// collapse window, keeping the first `A` of each run.
pub fn prune_price_history(mut history: Vec<PriceEntry>) -> Vec<PriceEntry> {
    history.sort_by_key(|entry| entry.date);
    let window = Duration::minutes(HISTORY_COLLAPSE_MINUTES);

    let mut pruned = Vec::with_capacity(history.len());
    let mut i = 0;
    while i < history.len() {
        let current = &history[i];
        let mut last_return = None;
        for (j, later) in history.iter().enumerate().skip(i + 1) {
            if later.date - current.date > window {
                break;
            }
            if later.price == current.price {
                last_return = Some(j);
            }
        }
        pruned.push(current.clone());
        i = match last_return {
            Some(j) => j + 1,
            None => i + 1,
        };
    }
    pruned
}

/// Removes id 0 and repeated ids, keeping the first occurrence.
pub fn dedup_by_id(listings: Vec<Listing>) -> Vec<Listing> {
    let mut seen = HashSet::with_capacity(listings.len());
    listings
        .into_iter()
        .filter(|listing| listing.id != 0 && seen.insert(listing.id))
        .collect()
}

/// Annotates every listing with trunc(sum(price) / sum(area)) over its
/// (segment, rooms, finish type) bucket in this batch.
pub fn annotate_bucket_averages(listings: &mut [Listing]) {
    let mut buckets: HashMap<(String, i8, FinishType), (i64, f64)> = HashMap::new();
    for listing in listings.iter() {
        let totals = buckets
            .entry((listing.block_slug.clone(), listing.rooms, listing.finish_type))
            .or_insert((0, 0.0));
        totals.0 += listing.price;
        totals.1 += listing.area;
    }

    for listing in listings.iter_mut() {
        let key = (listing.block_slug.clone(), listing.rooms, listing.finish_type);
        listing.average_price = match buckets.get(&key) {
            Some((price_sum, area_sum)) if *area_sum > 0.0 => (*price_sum as f64 / area_sum) as i64,
            _ => 0,
        };
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortMode {
    #[default]
    Price,
    BelowAverage,
}

pub fn sort_for_display(listings: &mut [Listing], mode: SortMode) {
    match mode {
        SortMode::Price => listings.sort_by_key(|listing| listing.price),
        SortMode::BelowAverage => listings.sort_by(|a, b| {
            a.below_average_percent()
                .total_cmp(&b.below_average_percent())
        }),
    }
}

/// Full persisted state of one segment.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default, deserialize_with = "null_as_default")]
    pub flats: Vec<Listing>,
    #[serde(rename = "lastPage", default)]
    pub last_page: u32,
}

impl Snapshot {
    pub fn find(&self, id: i64) -> Option<&Listing> {
        self.flats.iter().find(|listing| listing.id == id)
    }

    pub fn ids(&self) -> HashSet<i64> {
        self.flats.iter().map(|listing| listing.id).collect()
    }

    pub fn recently_updated(&self, now: DateTime<Utc>) -> Vec<Listing> {
        self.flats
            .iter()
            .filter(|listing| listing.recently_updated(now))
            .cloned()
            .collect()
    }

    /// Listings similar to `target` (the target included when present).
    pub fn similar_to(&self, target: &Listing) -> Vec<&Listing> {
        self.flats
            .iter()
            .filter(|listing| listing.is_similar(target))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeriesPoint {
    pub date: DateTime<Utc>,
    pub price: i64,
}

/// Running min/max envelopes over reserved-status observations of `listings`.
///
/// Two monotonic deques track the extremes of a trailing window; emissions closer than
/// the collapse period to the previous one overwrite it instead of adding a point.
pub fn price_min_max_series<'a, I>(listings: I) -> (Vec<SeriesPoint>, Vec<SeriesPoint>)
where
    I: IntoIterator<Item = &'a Listing>,
{
    let mut points: Vec<SeriesPoint> = listings
        .into_iter()
        .flat_map(|listing| listing.effective_history())
        .filter(|entry| entry.status == Some(ListingStatus::Reserved))
        .map(|entry| SeriesPoint {
            date: entry.date,
            price: entry.price,
        })
        .collect();
    points.sort_by_key(|point| point.date);

    let window = Duration::days(SERIES_WINDOW_DAYS);
    let collapse = Duration::hours(SERIES_COLLAPSE_HOURS);

    let mut min_deque: VecDeque<SeriesPoint> = VecDeque::new();
    let mut max_deque: VecDeque<SeriesPoint> = VecDeque::new();
    let mut min_series = Vec::new();
    let mut max_series = Vec::new();

    for point in points {
        while min_deque.back().is_some_and(|back| back.price >= point.price) {
            min_deque.pop_back();
        }
        while max_deque.back().is_some_and(|back| back.price <= point.price) {
            max_deque.pop_back();
        }
        min_deque.push_back(point);
        max_deque.push_back(point);

        let horizon = point.date - window;
        while min_deque.front().is_some_and(|front| front.date < horizon) {
            min_deque.pop_front();
        }
        while max_deque.front().is_some_and(|front| front.date < horizon) {
            max_deque.pop_front();
        }

        if let Some(front) = min_deque.front() {
            emit_series_point(&mut min_series, point.date, front.price, collapse);
        }
        if let Some(front) = max_deque.front() {
            emit_series_point(&mut max_series, point.date, front.price, collapse);
        }
    }

    (min_series, max_series)
}

fn emit_series_point(series: &mut Vec<SeriesPoint>, at: DateTime<Utc>, price: i64, collapse: Duration) {
    match series.last_mut() {
        Some(last) if last.price == price => {}
        Some(last) if at - last.date < collapse => last.price = price,
        _ => series.push(SeriesPoint { date: at, price }),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|date| date.with_timezone(&Utc))
}

fn deserialize_lenient_time<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.as_deref().and_then(parse_rfc3339))
}

#[derive(Deserialize)]
struct StoredPriceEntry {
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    price: i64,
    #[serde(default)]
    status: Option<String>,
}

impl StoredPriceEntry {
    fn into_entry(self) -> Option<PriceEntry> {
        let date = parse_rfc3339(self.date.as_deref()?)?;
        if date.timestamp() < HISTORY_EPOCH_SECS {
            return None;
        }
        let status = self
            .status
            .filter(|s| !s.trim().is_empty())
            .map(|s| ListingStatus::from_wire(&s));
        Some(PriceEntry {
            date,
            price: self.price,
            status,
        })
    }
}

fn deserialize_history<'de, D>(deserializer: D) -> Result<Vec<PriceEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<StoredPriceEntry>>::deserialize(deserializer)?.unwrap_or_default();
    Ok(raw.into_iter().filter_map(StoredPriceEntry::into_entry).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, minute, 0)
            .single()
            .unwrap()
    }

    fn entry(date: DateTime<Utc>, price: i64) -> PriceEntry {
        PriceEntry {
            date,
            price,
            status: Some(ListingStatus::Free),
        }
    }

    fn reserved(date: DateTime<Utc>, price: i64) -> PriceEntry {
        PriceEntry {
            date,
            price,
            status: Some(ListingStatus::Reserved),
        }
    }

    fn listing(id: i64, price: i64, area: f64, rooms: i8) -> Listing {
        Listing {
            id,
            price,
            area,
            rooms,
            block_slug: "2ngt".into(),
            block_name: "Second Nagatinsky".into(),
            finish_type: FinishType::Finished,
            ..Default::default()
        }
    }

    #[test]
    fn prune_collapses_return_to_price_within_an_hour() {
        let t0 = at(1, 10, 0);
        let history = vec![
            entry(t0, 100),
            entry(t0 + Duration::minutes(30), 120),
            entry(t0 + Duration::minutes(50), 100),
            entry(t0 + Duration::hours(3), 90),
        ];
        let pruned = prune_price_history(history);
        assert_eq!(pruned, vec![entry(t0, 100), entry(t0 + Duration::hours(3), 90)]);
    }

    #[test]
    fn prune_keeps_true_excursions_outside_window() {
        let t0 = at(1, 10, 0);
        let history = vec![
            entry(t0, 100),
            entry(t0 + Duration::minutes(30), 120),
            entry(t0 + Duration::minutes(90), 100),
        ];
        assert_eq!(prune_price_history(history.clone()), history);
    }

    #[test]
    fn prune_is_idempotent_and_sorts_by_date() {
        let t0 = at(2, 8, 0);
        let history = vec![
            entry(t0 + Duration::minutes(100), 95),
            entry(t0 + Duration::minutes(40), 100),
            entry(t0, 100),
            entry(t0 + Duration::minutes(50), 110),
            entry(t0 + Duration::minutes(70), 110),
            entry(t0 + Duration::hours(5), 80),
        ];
        let once = prune_price_history(history);
        let twice = prune_price_history(once.clone());
        assert_eq!(once, twice);
        assert!(once.windows(2).all(|w| w[0].date <= w[1].date));
    }

    #[test]
    fn history_load_drops_invalid_and_pre_epoch_dates() {
        let json = r#"{
            "id": 1, "price": 123, "status": "free", "updated": "2024-01-02T03:04:05Z",
            "priceHistory": [
                {"date": "2022-12-31T23:59:59Z", "price": 100, "status": "free"},
                {"date": "invalid-date", "price": 101, "status": "free"},
                {"date": "2023-01-01T00:00:00Z", "price": 110, "status": "free"},
                {"date": "2024-01-01T00:00:00Z", "price": 120, "status": "reserve"}
            ]
        }"#;
        let listing: Listing = serde_json::from_str(json).unwrap();
        let history = listing.effective_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].date.to_rfc3339(), "2023-01-01T00:00:00+00:00");
        assert_eq!(history[1].status, Some(ListingStatus::Reserved));
    }

    #[test]
    fn effective_history_seeds_from_current_observation() {
        let mut l = listing(7, 5_000_000, 30.0, 1);
        l.status = ListingStatus::Reserved;
        l.updated = Some(at(5, 12, 0));
        let history = l.effective_history();
        assert_eq!(history, vec![reserved(at(5, 12, 0), 5_000_000)]);
    }

    #[test]
    fn upstream_item_decodes_with_nulls_and_unknown_fields() {
        let json = r##"{"id":830713,"area":65.2,"floor":17,"metro":{"id":148,"name":"Nagatinskaya","color":"#ACADAF"},
            "price":21796360,"rooms":2,"status":"free","typeId":1,"planUrl":null,
            "bulkName":"Building 1.1","maxFloor":33,"blockName":"Second Nagatinsky",
            "blockSlug":"2ngt","finishType":1,"meterPrice":334300,"settlementDate":null}"##;
        let l: Listing = serde_json::from_str(json).unwrap();
        assert_eq!(l.id, 830713);
        assert_eq!(l.finish_type, FinishType::Finished);
        assert_eq!(l.status, ListingStatus::Free);
        assert_eq!(l.metro.name, "Nagatinskaya");
        assert!(l.settlement_date.is_empty());
        assert!(l.created.is_none());
    }

    #[test]
    fn unknown_status_maps_to_other() {
        let l: Listing = serde_json::from_str(r#"{"id":1,"status":"booked-by-agent"}"#).unwrap();
        assert_eq!(l.status, ListingStatus::Other);
        assert_eq!(ListingStatus::from_wire("Reserve"), ListingStatus::Reserved);
    }

    #[test]
    fn snapshot_round_trip_preserves_listings_and_histories() {
        let mut a = listing(1, 10_000_000, 50.0, 2);
        a.created = Some(at(1, 0, 0));
        a.updated = Some(at(3, 0, 0));
        a.average_price = 200_000;
        a.old_price = 10_500_000;
        a.price_history = vec![entry(at(1, 0, 0), 10_500_000), reserved(at(3, 0, 0), 10_000_000)];
        let mut b = listing(2, 7_000_000, 35.5, 1);
        b.finish_type = FinishType::WhiteBox;
        b.updated = Some(at(3, 0, 0));
        let snapshot = Snapshot {
            flats: vec![a, b],
            last_page: 3,
        };

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"flats\""));
        assert!(json.contains("\"priceHistory\""));
        let decoded: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn bucket_averages_use_fresh_batch_per_bucket() {
        let mut batch = vec![
            listing(1, 10_000_000, 50.0, 2),
            listing(2, 14_000_000, 50.0, 2),
            listing(3, 9_000_000, 30.0, 1),
            Listing {
                finish_type: FinishType::None,
                ..listing(4, 6_000_000, 40.0, 2)
            },
        ];
        annotate_bucket_averages(&mut batch);
        assert_eq!(batch[0].average_price, 240_000);
        assert_eq!(batch[1].average_price, 240_000);
        assert_eq!(batch[2].average_price, 300_000);
        assert_eq!(batch[3].average_price, 150_000);
        assert!(batch[0].below_average_percent() < 0.0);
    }

    #[test]
    fn bucket_average_of_zero_area_is_zero() {
        let mut batch = vec![listing(1, 1_000, 0.0, 1)];
        annotate_bucket_averages(&mut batch);
        assert_eq!(batch[0].average_price, 0);
        assert_eq!(batch[0].below_average_percent(), 0.0);
    }

    #[test]
    fn drop_threshold_is_exact_at_boundaries() {
        assert!(price_drop_reaches(100, 85, 15));
        assert!(!price_drop_reaches(100, 86, 15));
        assert!(price_drop_reaches(100, 80, 20));
        assert!(!price_drop_reaches(100, 81, 20));
        assert!(!price_drop_reaches(100, 90, 15));
        assert!(!price_drop_reaches(0, 0, 15));
        assert!(!price_drop_reaches(1_000, 851, 15));
    }

    #[test]
    fn dedup_keeps_first_and_drops_invalid_ids() {
        let deduped = dedup_by_id(vec![
            listing(1, 100, 10.0, 1),
            listing(0, 100, 10.0, 1),
            listing(1, 999, 10.0, 1),
            listing(2, 200, 10.0, 1),
        ]);
        let ids: Vec<i64> = deduped.iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(deduped[0].price, 100);
    }

    #[test]
    fn similarity_requires_rooms_finish_and_area_within_two_percent() {
        let target = listing(1, 100, 50.0, 2);
        assert!(listing(2, 100, 50.9, 2).is_similar(&target));
        assert!(!listing(3, 100, 51.5, 2).is_similar(&target));
        assert!(!listing(4, 100, 50.0, 3).is_similar(&target));
        let unfinished = Listing {
            finish_type: FinishType::None,
            ..listing(5, 100, 50.0, 2)
        };
        assert!(!unfinished.is_similar(&target));
    }

    #[test]
    fn weekly_change_uses_latest_entry_older_than_a_week() {
        let now = at(20, 12, 0);
        let mut l = listing(1, 9_000_000, 40.0, 1);
        l.updated = Some(now);
        l.price_history = vec![
            entry(at(1, 0, 0), 12_000_000),
            entry(at(10, 0, 0), 10_000_000),
            entry(at(19, 0, 0), 9_000_000),
        ];
        let change = l.weekly_price_change_percent(now).unwrap();
        assert!((change + 10.0).abs() < 1e-9);

        l.price_history = vec![entry(at(19, 0, 0), 9_000_000)];
        assert!(l.weekly_price_change_percent(now).is_none());
    }

    #[test]
    fn recently_updated_window_is_one_hour() {
        let now = at(10, 12, 0);
        let mut l = listing(1, 100, 10.0, 1);
        l.updated = Some(now - Duration::minutes(59));
        assert!(l.recently_updated(now));
        l.updated = Some(now - Duration::minutes(61));
        assert!(!l.recently_updated(now));
        l.updated = None;
        assert!(!l.recently_updated(now));
    }

    #[test]
    fn sliding_window_holds_planted_minimum_for_fourteen_days() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().unwrap();
        let planted_day = 5;
        let history: Vec<PriceEntry> = (0..30)
            .map(|day| {
                let price = if day == planted_day { 50 } else { 100 };
                reserved(start + Duration::days(day), price)
            })
            .collect();
        let l = Listing {
            price_history: history,
            ..listing(1, 100, 40.0, 1)
        };

        let (min_series, max_series) = price_min_max_series([&l]);
        let planted_at = start + Duration::days(planted_day);
        assert_eq!(
            min_series,
            vec![
                SeriesPoint { date: start, price: 100 },
                SeriesPoint { date: planted_at, price: 50 },
                SeriesPoint {
                    date: planted_at + Duration::days(SERIES_WINDOW_DAYS + 1),
                    price: 100
                },
            ]
        );
        assert_eq!(max_series, vec![SeriesPoint { date: start, price: 100 }]);
    }

    #[test]
    fn series_ignores_non_reserved_entries_and_collapses_within_a_day() {
        let t0 = at(1, 9, 0);
        let a = Listing {
            price_history: vec![
                reserved(t0, 300),
                entry(t0 + Duration::hours(1), 10),
                reserved(t0 + Duration::hours(2), 200),
            ],
            ..listing(1, 200, 40.0, 1)
        };
        let b = Listing {
            price_history: vec![reserved(t0 + Duration::days(2), 100)],
            ..listing(2, 100, 40.0, 1)
        };

        let (min_series, max_series) = price_min_max_series([&a, &b]);
        assert_eq!(
            min_series,
            vec![
                SeriesPoint { date: t0, price: 200 },
                SeriesPoint {
                    date: t0 + Duration::days(2),
                    price: 100
                },
            ]
        );
        assert_eq!(max_series, vec![SeriesPoint { date: t0, price: 300 }]);
    }

    #[test]
    fn display_sort_modes() {
        let mut batch = vec![listing(1, 300, 10.0, 1), listing(2, 100, 10.0, 1), listing(3, 200, 5.0, 1)];
        batch[0].average_price = 10;
        batch[1].average_price = 20;
        batch[2].average_price = 40;
        sort_for_display(&mut batch, SortMode::Price);
        assert_eq!(batch.iter().map(|l| l.id).collect::<Vec<_>>(), vec![2, 3, 1]);
        sort_for_display(&mut batch, SortMode::BelowAverage);
        assert_eq!(batch.iter().map(|l| l.id).collect::<Vec<_>>(), vec![2, 3, 1]);
    }
}
