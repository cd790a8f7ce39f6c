//! Core domain model for adwatch.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "adwatch-core";

/// Activity status of a listing as last resolved against the source.
///
/// `Unknown` means the listing has never been enriched; the store keeps no
/// `Inactive` rows for long (they are deleted on sight), but the variant exists
/// so an extraction verdict is representable before the delete happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActiveState {
    Unknown,
    Active,
    Inactive,
}

impl ActiveState {
    pub fn to_db(self) -> Option<i64> {
        match self {
            ActiveState::Unknown => None,
            ActiveState::Active => Some(1),
            ActiveState::Inactive => Some(0),
        }
    }

    pub fn from_db(value: Option<i64>) -> Self {
        match value {
            None => ActiveState::Unknown,
            Some(0) => ActiveState::Inactive,
            Some(_) => ActiveState::Active,
        }
    }

    pub fn is_inactive(self) -> bool {
        matches!(self, ActiveState::Inactive)
    }
}

/// One marketplace listing, keyed by the source-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: String,
    pub title: Option<String>,
    pub ad_url: Option<String>,
    pub image_url: Option<String>,
    pub all_photos: Vec<String>,
    pub price_value: Option<i64>,
    pub price_currency: Option<String>,
    pub price_uah: Option<i64>,
    pub price_raw: Option<String>,
    pub location_raw: Option<String>,
    /// Set once at first acquisition; never rewritten afterwards.
    pub created_at: DateTime<Utc>,
    pub last_full_check: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub full_description: Option<String>,
    pub seller_name: Option<String>,
    pub params: BTreeMap<String, String>,
    pub is_active: ActiveState,
    pub is_favorite: bool,
    pub sent_notification: bool,
}

impl Listing {
    /// A bare listing as produced by acquisition: id, created_at, and whatever
    /// feed-level fields are known. Enrichment fills in the rest later.
    pub fn acquired(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: None,
            ad_url: None,
            image_url: None,
            all_photos: Vec::new(),
            price_value: None,
            price_currency: None,
            price_uah: None,
            price_raw: None,
            location_raw: None,
            created_at,
            last_full_check: None,
            description: None,
            full_description: None,
            seller_name: None,
            params: BTreeMap::new(),
            is_active: ActiveState::Unknown,
            is_favorite: false,
            sent_notification: false,
        }
    }
}

/// Partial enrichment patch. `None` fields are left untouched in the store, so
/// a degraded (fallback) extraction never erases data a structured pass
/// captured earlier. `checked_at` always advances `last_full_check`.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrichmentUpdate {
    pub description: Option<String>,
    pub full_description: Option<String>,
    pub seller_name: Option<String>,
    pub params: Option<BTreeMap<String, String>>,
    pub all_photos: Option<Vec<String>>,
    pub checked_at: DateTime<Utc>,
}

impl EnrichmentUpdate {
    pub fn at(checked_at: DateTime<Utc>) -> Self {
        Self {
            description: None,
            full_description: None,
            seller_name: None,
            params: None,
            all_photos: None,
            checked_at,
        }
    }
}

/// Deterministic price canonicalization. The source-converted value wins; a raw
/// UAH value is taken as-is; any other currency converts only through an
/// explicitly configured fixed rate. No implicit exchange-rate guessing.
pub fn price_to_uah(
    value: Option<f64>,
    currency: Option<&str>,
    converted_value: Option<f64>,
    fixed_rates: &BTreeMap<String, f64>,
) -> Option<i64> {
    if let Some(converted) = converted_value {
        return Some(converted.round() as i64);
    }
    match (value, currency) {
        (Some(v), Some("UAH")) => Some(v.round() as i64),
        (Some(v), Some(cur)) => fixed_rates.get(cur).map(|rate| (v * rate).round() as i64),
        _ => None,
    }
}
