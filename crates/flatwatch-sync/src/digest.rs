use chrono::{DateTime, Utc};
use flatwatch_core::{sort_for_display, Listing, ListingStatus, SortMode};
use serde::Serialize;

use crate::reconcile::ReconcileReport;

/// Leading marker on digests meant for every known recipient.
pub const BROADCAST_MARKER: &str = "!!! ";

const LISTING_URL_PREFIX: &str = "https://www.pik.ru/flat/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DigestKind {
    NewListings,
    PriceDrops,
    ExtremeDrops,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Audience {
    Subscribers,
    Broadcast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Digest {
    pub kind: DigestKind,
    pub audience: Audience,
    pub segment: String,
    pub text: String,
}

/// `1234567` -> `1 234 567`.
pub fn thousands(value: i64) -> String {
    let digits = value.unsigned_abs().to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    if value < 0 {
        out.push('-');
    }
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(' ');
        }
        out.push(ch);
    }
    out
}

/// `2025-06-15` -> `25Q2`; short or missing dates mean the building is already delivered.
pub fn settlement_quarter(date: &str) -> String {
    let year = match date.get(..4) {
        Some(year) if date.len() >= 10 && year.bytes().all(|b| b.is_ascii_digit()) => year,
        _ => return "delivered".to_string(),
    };
    let month = date
        .get(5..7)
        .and_then(|month| month.parse::<u32>().ok())
        .filter(|month| (1..=12).contains(month));
    match month {
        Some(month) => format!("{}Q{}", &year[2..], (month - 1) / 3 + 1),
        None => year.to_string(),
    }
}

fn building_label(bulk_name: &str) -> &str {
    bulk_name.split(' ').nth(1).unwrap_or(bulk_name)
}

/// One listing as a digest line.
pub fn format_listing_line(listing: &Listing, now: DateTime<Utc>) -> String {
    let reserved = if listing.status == ListingStatus::Reserved {
        " (reserved)"
    } else {
        ""
    };
    let mut line = format!(
        "{}: {LISTING_URL_PREFIX}{} {}r, {:.1}m2, {}R, f{}{reserved}, {}, {}",
        building_label(&listing.bulk_name),
        listing.id,
        listing.rooms,
        listing.area,
        thousands(listing.price),
        listing.floor,
        settlement_quarter(&listing.settlement_date),
        listing.finish_type.label(),
    );

    let mut price_info = Vec::new();
    if listing.average_price != 0 {
        price_info.push(format!("avg{:+.1}%", listing.below_average_percent()));
    }
    if let Some(change) = listing.weekly_price_change_percent(now) {
        let arrow = if change > 0.0 { '^' } else { 'v' };
        price_info.push(format!("{arrow}{:.1}%", change.abs()));
    }
    if !price_info.is_empty() {
        line.push_str(", ");
        line.push_str(&price_info.join(", "));
    }
    line
}

fn drop_line(listing: &Listing, now: DateTime<Utc>) -> String {
    format!(
        "{}, price{:.1}%",
        format_listing_line(listing, now),
        listing.price_drop_percent()
    )
}

fn block_name(listings: &[Listing], fallback: &str) -> String {
    listings
        .first()
        .map(|listing| listing.block_name.trim())
        .filter(|name| !name.is_empty())
        .unwrap_or(fallback)
        .to_string()
}

/// Listing dump sorted for display, or `None` when there is nothing to show.
pub fn listings_text(
    listings: &[Listing],
    mode: SortMode,
    segment: &str,
    now: DateTime<Utc>,
) -> Option<String> {
    if listings.is_empty() {
        return None;
    }
    let mut sorted = listings.to_vec();
    sort_for_display(&mut sorted, mode);
    let mut text = format!(
        "{} flats on sale in {}:",
        sorted.len(),
        block_name(&sorted, segment)
    );
    for listing in &sorted {
        text.push('\n');
        text.push_str(&format_listing_line(listing, now));
    }
    Some(text)
}

fn drops_text(header: &str, listings: &[Listing], segment: &str, now: DateTime<Utc>) -> String {
    let mut sorted = listings.to_vec();
    sorted.sort_by(|a, b| a.price_drop_percent().total_cmp(&b.price_drop_percent()));
    let mut text = format!(
        "{} {header} {}:",
        sorted.len(),
        block_name(&sorted, segment)
    );
    for listing in &sorted {
        text.push('\n');
        text.push_str(&drop_line(listing, now));
    }
    text
}

/// Up to three digests per reconciliation; empty categories produce nothing.
pub fn digests_for(report: &ReconcileReport, now: DateTime<Utc>) -> Vec<Digest> {
    let segment = report.segment.as_str();
    let mut digests = Vec::new();

    if !report.new_listings.is_empty() {
        let mut sorted = report.new_listings.clone();
        sort_for_display(&mut sorted, SortMode::Price);
        let mut text = format!("{} new flats in {}:", sorted.len(), block_name(&sorted, segment));
        for listing in &sorted {
            text.push('\n');
            text.push_str(&format_listing_line(listing, now));
        }
        digests.push(Digest {
            kind: DigestKind::NewListings,
            audience: Audience::Subscribers,
            segment: segment.to_string(),
            text,
        });
    }

    if !report.price_drops.is_empty() {
        digests.push(Digest {
            kind: DigestKind::PriceDrops,
            audience: Audience::Subscribers,
            segment: segment.to_string(),
            text: drops_text("flats dropped prices in", &report.price_drops, segment, now),
        });
    }

    if !report.extreme.is_empty() {
        digests.push(Digest {
            kind: DigestKind::ExtremeDrops,
            audience: Audience::Broadcast,
            segment: segment.to_string(),
            text: format!(
                "{BROADCAST_MARKER}{}",
                drops_text("extreme price drops in", &report.extreme, segment, now)
            ),
        });
    }

    digests
}
