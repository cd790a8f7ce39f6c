//! Acquisition loop: pull feed pages, screen offers through the filter chain,
//! and insert survivors idempotently.

use std::collections::BTreeMap;

use adwatch_core::{price_to_uah, Listing};
use adwatch_source::{resolve_photo_url, FeedFetch, FeedQuery, RawOffer};
use adwatch_store::{ListingStore, StoreError};
use chrono::{DateTime, Utc};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::{AppConfig, Pacing, Shutdown};

/// Thumbnail size requested for the feed-level primary photo.
const THUMB_WIDTH: u32 = 640;
const THUMB_HEIGHT: u32 = 480;

/// First failed check wins; later checks are not evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    Category,
    StopWord,
    NoPhotos,
    Price,
    DateFloor,
    Location,
}

/// Local screening rules, applied in a fixed order after the server-side feed
/// filters. Word lists are held lowercased.
#[derive(Debug, Clone)]
pub struct OfferFilters {
    category_id: Option<i64>,
    stop_words: Vec<String>,
    min_price_uah: Option<i64>,
    max_price_uah: Option<i64>,
    min_created_date: Option<String>,
    location_keywords: Vec<String>,
    conversion_rates: BTreeMap<String, f64>,
}

impl OfferFilters {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            category_id: config.category_id,
            stop_words: config.stop_words.iter().map(|w| w.to_lowercase()).collect(),
            min_price_uah: config.min_price_uah,
            max_price_uah: config.max_price_uah,
            min_created_date: config.min_created_date.clone(),
            location_keywords: config
                .location_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            conversion_rates: config.conversion_rates.clone(),
        }
    }

    fn price_uah(&self, offer: &RawOffer) -> Option<i64> {
        let price = offer.price()?;
        price_to_uah(
            price.value,
            price.currency.as_deref(),
            price.converted_value,
            &self.conversion_rates,
        )
    }
}

/// Run the ordered filter chain: category, stop word, photo, price, date
/// floor, location. Checks with no configured criterion pass implicitly.
pub fn screen(offer: &RawOffer, filters: &OfferFilters) -> Result<(), Rejection> {
    if let Some(required) = filters.category_id {
        let category = offer.category.as_ref().and_then(|c| c.id);
        if category != Some(required) {
            return Err(Rejection::Category);
        }
    }

    if !filters.stop_words.is_empty() {
        let title = offer.title.as_deref().unwrap_or_default().to_lowercase();
        if filters.stop_words.iter().any(|word| title.contains(word)) {
            return Err(Rejection::StopWord);
        }
    }

    if offer.first_photo().is_none() {
        return Err(Rejection::NoPhotos);
    }

    if filters.min_price_uah.is_some() || filters.max_price_uah.is_some() {
        match filters.price_uah(offer) {
            Some(price) => {
                if filters.min_price_uah.is_some_and(|min| price < min)
                    || filters.max_price_uah.is_some_and(|max| price > max)
                {
                    return Err(Rejection::Price);
                }
            }
            // Bounds configured but no canonical price: cannot prove it fits.
            None => return Err(Rejection::Price),
        }
    }

    if let Some(floor) = filters.min_created_date.as_deref() {
        // ISO-shaped timestamps compare lexicographically on the date prefix.
        // A value too short or not sliceable at 10 bytes is no date at all and
        // cannot prove it meets the floor.
        match offer.created_time.as_deref().and_then(|created| created.get(..10)) {
            Some(date) if date >= floor => {}
            _ => return Err(Rejection::DateFloor),
        }
    }

    if !filters.location_keywords.is_empty() {
        let label = offer.location_label().unwrap_or_default().to_lowercase();
        if !filters
            .location_keywords
            .iter()
            .any(|keyword| label.contains(keyword))
        {
            return Err(Rejection::Location);
        }
    }

    Ok(())
}

/// Shape a screened offer into a storable listing. `created_at` prefers the
/// source creation time and falls back to `now`.
pub fn canonicalize(offer: &RawOffer, filters: &OfferFilters, now: DateTime<Utc>) -> Listing {
    let created_at = offer
        .created_time
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(now);

    let mut listing = Listing::acquired(offer.id.clone(), created_at);
    listing.title = offer.title.clone();
    listing.ad_url = offer.url.clone();
    listing.location_raw = offer.location_label().map(str::to_string);
    listing.image_url = offer
        .first_photo()
        .map(|link| resolve_photo_url(link, THUMB_WIDTH, THUMB_HEIGHT));

    if let Some(price) = offer.price() {
        listing.price_value = price.value.map(|v| v.round() as i64);
        listing.price_currency = price.currency.clone();
        listing.price_uah = filters.price_uah(offer);
        listing.price_raw = serde_json::to_string(&price).ok();
    }
    listing
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub pages: u32,
    pub failed_pages: u32,
    pub inserted: u32,
    pub duplicates: u32,
    pub rejected_category: u32,
    pub rejected_stop_word: u32,
    pub rejected_no_photos: u32,
    pub rejected_price: u32,
    pub rejected_date: u32,
    pub rejected_location: u32,
}

impl CycleStats {
    fn note_rejection(&mut self, rejection: Rejection) {
        let slot = match rejection {
            Rejection::Category => &mut self.rejected_category,
            Rejection::StopWord => &mut self.rejected_stop_word,
            Rejection::NoPhotos => &mut self.rejected_no_photos,
            Rejection::Price => &mut self.rejected_price,
            Rejection::DateFloor => &mut self.rejected_date,
            Rejection::Location => &mut self.rejected_location,
        };
        *slot += 1;
    }

    pub fn rejected(&self) -> u32 {
        self.rejected_category
            + self.rejected_stop_word
            + self.rejected_no_photos
            + self.rejected_price
            + self.rejected_date
            + self.rejected_location
    }
}

pub struct AcquisitionScheduler<F> {
    feed: F,
    store: ListingStore,
    filters: OfferFilters,
    query: FeedQuery,
    offsets: Vec<u32>,
    pacing: Pacing,
}

impl<F: FeedFetch> AcquisitionScheduler<F> {
    pub fn new(feed: F, store: ListingStore, config: &AppConfig) -> Self {
        Self {
            feed,
            store,
            filters: OfferFilters::from_config(config),
            query: config.feed_query(),
            offsets: config.feed_offsets.clone(),
            pacing: config.acquire_pacing(),
        }
    }

    /// One pass over all configured feed offsets. A failed page is skipped;
    /// store errors abort the cycle so the caller sees them.
    pub async fn cycle(&self) -> Result<CycleStats, StoreError> {
        let run_id = Uuid::new_v4();
        self.cycle_inner()
            .instrument(info_span!("acquire_cycle", run_id = %run_id))
            .await
    }

    async fn cycle_inner(&self) -> Result<CycleStats, StoreError> {
        let mut stats = CycleStats::default();
        for &offset in &self.offsets {
            let offers = match self.feed.fetch_listing_page(offset, &self.query).await {
                Ok(offers) => offers,
                Err(err) => {
                    warn!(offset, error = %err, "feed page skipped");
                    stats.failed_pages += 1;
                    continue;
                }
            };
            stats.pages += 1;

            for offer in &offers {
                if let Err(rejection) = screen(offer, &self.filters) {
                    stats.note_rejection(rejection);
                    continue;
                }
                let listing = canonicalize(offer, &self.filters, Utc::now());
                if self.store.upsert_if_absent(&listing).await? {
                    info!(
                        id = %listing.id,
                        title = listing.title.as_deref().unwrap_or("?"),
                        price_uah = listing.price_uah,
                        "new listing"
                    );
                    stats.inserted += 1;
                } else {
                    stats.duplicates += 1;
                }
            }
        }
        Ok(stats)
    }

    pub async fn run(self, mut shutdown: Shutdown) {
        loop {
            if shutdown.is_triggered() {
                break;
            }
            match self.cycle().await {
                Ok(stats) => info!(
                    inserted = stats.inserted,
                    duplicates = stats.duplicates,
                    rejected = stats.rejected(),
                    failed_pages = stats.failed_pages,
                    "acquisition cycle finished"
                ),
                Err(err) => tracing::error!(error = %err, "acquisition cycle failed"),
            }
            if shutdown.sleep(self.pacing.pick()).await {
                break;
            }
        }
        info!("acquisition loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adwatch_source::{FeedError, RawCategory, RawLocation, RawPrice};
    use async_trait::async_trait;
    use chrono::TimeZone;

    fn offer(id: &str, title: &str) -> RawOffer {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "title": title,
            "url": format!("https://market.example/d/obyavlenie/{id}.html"),
            "category": {"id": 1532},
            "price": {"value": 250000.0, "currency": "UAH", "converted_value": null},
            "photos": [{"link": "https://img.example/1;s={width}x{height}"}],
            "location": {"label": "Київ, Оболонський"},
            "created_time": "2026-08-20T09:30:00+03:00"
        }))
        .expect("offer")
    }

    fn filters() -> OfferFilters {
        OfferFilters::from_config(&AppConfig {
            category_id: Some(1532),
            stop_words: vec!["трактор".to_string(), "шрот".to_string()],
            min_price_uah: Some(2000),
            max_price_uah: Some(300_000),
            min_created_date: Some("2026-01-01".to_string()),
            location_keywords: vec!["київ".to_string(), "область".to_string()],
            ..AppConfig::default()
        })
    }

    #[test]
    fn clean_offer_passes_every_check() {
        assert_eq!(screen(&offer("a1", "BMW 320"), &filters()), Ok(()));
    }

    #[test]
    fn first_failing_check_wins() {
        // Fails both the stop-word and the photo check; the chain reports the
        // earlier one.
        let mut bad = offer("a2", "Трактор МТЗ");
        bad.photos.clear();
        assert_eq!(screen(&bad, &filters()), Err(Rejection::StopWord));

        let mut no_photos = offer("a3", "BMW 320");
        no_photos.photos.clear();
        assert_eq!(screen(&no_photos, &filters()), Err(Rejection::NoPhotos));
    }

    #[test]
    fn category_mismatch_is_rejected() {
        let mut wrong = offer("a4", "BMW 320");
        wrong.category = Some(RawCategory { id: Some(9) });
        assert_eq!(screen(&wrong, &filters()), Err(Rejection::Category));
    }

    #[test]
    fn price_bounds_require_a_canonical_price() {
        let mut costly = offer("a5", "Audi A8");
        costly.price = Some(RawPrice {
            value: Some(900_000.0),
            currency: Some("UAH".to_string()),
            converted_value: None,
        });
        assert_eq!(screen(&costly, &filters()), Err(Rejection::Price));

        // Foreign currency without a configured rate resolves to no price.
        let mut unresolved = offer("a6", "Audi A4");
        unresolved.price = Some(RawPrice {
            value: Some(9000.0),
            currency: Some("USD".to_string()),
            converted_value: None,
        });
        assert_eq!(screen(&unresolved, &filters()), Err(Rejection::Price));

        // No bounds configured: the same offer passes.
        let open = OfferFilters::from_config(&AppConfig {
            category_id: Some(1532),
            location_keywords: vec!["київ".to_string()],
            min_created_date: Some("2026-01-01".to_string()),
            ..AppConfig::default()
        });
        assert_eq!(screen(&unresolved, &open), Ok(()));
    }

    #[test]
    fn date_floor_and_location_reject() {
        let mut old = offer("a7", "BMW 320");
        old.created_time = Some("2025-12-31T23:59:59+02:00".to_string());
        assert_eq!(screen(&old, &filters()), Err(Rejection::DateFloor));

        let mut elsewhere = offer("a8", "BMW 320");
        elsewhere.location = Some(RawLocation {
            label: Some("Львів".to_string()),
        });
        assert_eq!(screen(&elsewhere, &filters()), Err(Rejection::Location));
    }

    #[test]
    fn mangled_creation_timestamp_is_rejected_not_fatal() {
        // Cyrillic in the first ten bytes; slicing must not panic.
        let mut mangled = offer("a9", "BMW 320");
        mangled.created_time = Some("aддддд".to_string());
        assert_eq!(screen(&mangled, &filters()), Err(Rejection::DateFloor));

        let mut short = offer("a10", "BMW 320");
        short.created_time = Some("2026".to_string());
        assert_eq!(screen(&short, &filters()), Err(Rejection::DateFloor));
    }

    #[test]
    fn canonicalize_shapes_a_listing() {
        let now = Utc.with_ymd_and_hms(2026, 8, 21, 12, 0, 0).single().expect("now");
        let listing = canonicalize(&offer("c1", "BMW 320"), &filters(), now);

        assert_eq!(listing.id, "c1");
        assert_eq!(listing.title.as_deref(), Some("BMW 320"));
        // Source creation time wins over `now` and converts to UTC.
        assert_eq!(
            listing.created_at,
            Utc.with_ymd_and_hms(2026, 8, 20, 6, 30, 0).single().expect("ts")
        );
        assert_eq!(
            listing.image_url.as_deref(),
            Some("https://img.example/1;s=640x480")
        );
        assert_eq!(listing.price_value, Some(250_000));
        assert_eq!(listing.price_uah, Some(250_000));
        assert!(listing.price_raw.as_deref().is_some_and(|raw| raw.contains("250000")));
        assert_eq!(listing.location_raw.as_deref(), Some("Київ, Оболонський"));
        assert!(listing.all_photos.is_empty());
    }

    #[test]
    fn canonicalize_falls_back_to_now_on_bad_timestamp() {
        let now = Utc.with_ymd_and_hms(2026, 8, 21, 12, 0, 0).single().expect("now");
        let mut raw = offer("c2", "BMW 320");
        raw.created_time = Some("yesterday-ish".to_string());
        assert_eq!(canonicalize(&raw, &filters(), now).created_at, now);
    }

    struct StubFeed {
        offers: Vec<RawOffer>,
    }

    #[async_trait]
    impl FeedFetch for StubFeed {
        async fn fetch_listing_page(
            &self,
            offset: u32,
            _query: &FeedQuery,
        ) -> Result<Vec<RawOffer>, FeedError> {
            if offset == 0 {
                Ok(self.offers.clone())
            } else if offset == 50 {
                Err(FeedError::Status { status: 500 })
            } else {
                Ok(Vec::new())
            }
        }
    }

    #[tokio::test]
    async fn cycle_is_idempotent_and_survives_page_errors() {
        let store = ListingStore::open_in_memory().await.expect("store");
        let scheduler = AcquisitionScheduler::new(
            StubFeed {
                offers: vec![
                    offer("s1", "BMW 320"),
                    offer("s2", "Audi A4"),
                    offer("s3", "Трактор МТЗ"),
                ],
            },
            store.clone(),
            &AppConfig {
                category_id: Some(1532),
                stop_words: vec!["трактор".to_string()],
                location_keywords: vec!["київ".to_string()],
                ..AppConfig::default()
            },
        );

        let first = scheduler.cycle().await.expect("first cycle");
        assert_eq!(first.inserted, 2);
        assert_eq!(first.duplicates, 0);
        assert_eq!(first.rejected_stop_word, 1);
        assert_eq!(first.failed_pages, 1);
        assert_eq!(first.pages, 2);

        let second = scheduler.cycle().await.expect("second cycle");
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(store.count().await.expect("count"), 2);
    }
}
