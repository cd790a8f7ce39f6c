//! SQLite-backed listing store with idempotent upsert and write-then-verify.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use adwatch_core::{ActiveState, EnrichmentUpdate, Listing};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "adwatch-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    /// A row read back immediately after an insert does not match what was
    /// written. Indicates storage corruption; never swallowed.
    #[error("integrity failure for listing {id}: field `{field}` does not match what was written")]
    Integrity { id: String, field: &'static str },
    #[error("unreadable row for listing {id}: {reason}")]
    Decode { id: String, reason: String },
}

/// Viewer-facing query filters. All filters are optional and combine with AND.
#[derive(Debug, Clone)]
pub struct ListingQuery {
    pub min_price_uah: Option<i64>,
    pub max_price_uah: Option<i64>,
    /// Inclusive creation-date range; `created_to` extends to end of day.
    pub created_from: Option<NaiveDate>,
    pub created_to: Option<NaiveDate>,
    /// Case-insensitive substring match on title or location.
    pub text: Option<String>,
    pub favorites_only: bool,
    pub sort: SortOrder,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ListingQuery {
    fn default() -> Self {
        Self {
            min_price_uah: None,
            max_price_uah: None,
            created_from: None,
            created_to: None,
            text: None,
            favorites_only: false,
            sort: SortOrder::Newest,
            limit: 200,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Newest,
    PriceAsc,
    PriceDesc,
}

/// Columns added after the first-generation schema. Bootstrap adds any of these
/// missing from an existing table, so old snapshot files keep working and their
/// rows read the new fields as NULL/zero.
const ADDITIVE_COLUMNS: &[(&str, &str)] = &[
    ("description", "TEXT"),
    ("full_description", "TEXT"),
    ("seller_name", "TEXT"),
    ("params", "TEXT"),
    ("all_photos", "TEXT"),
    ("is_active", "INTEGER"),
    ("last_full_check", "TEXT"),
    ("is_favorite", "INTEGER NOT NULL DEFAULT 0"),
    ("sent_notification", "INTEGER NOT NULL DEFAULT 0"),
];

#[derive(Debug, Clone)]
pub struct ListingStore {
    pool: SqlitePool,
}

impl ListingStore {
    /// Open (or create) the snapshot database at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::from_pool(pool).await
    }

    /// Single-connection in-memory store, used by tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, bootstrapping the schema first.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        ensure_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Atomic insert-or-ignore by id. Returns whether a new row was written;
    /// a freshly written row is immediately read back and compared field by
    /// field against the input.
    pub async fn upsert_if_absent(&self, listing: &Listing) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO listings (
                id, title, ad_url, image_url, all_photos,
                price_value, price_currency, price_uah, price_raw, location_raw,
                created_at, last_full_check,
                description, full_description, seller_name, params,
                is_active, is_favorite, sent_notification
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&listing.id)
        .bind(&listing.title)
        .bind(&listing.ad_url)
        .bind(&listing.image_url)
        .bind(encode_photos(&listing.all_photos))
        .bind(listing.price_value)
        .bind(&listing.price_currency)
        .bind(listing.price_uah)
        .bind(&listing.price_raw)
        .bind(&listing.location_raw)
        .bind(encode_ts(listing.created_at))
        .bind(listing.last_full_check.map(encode_ts))
        .bind(&listing.description)
        .bind(&listing.full_description)
        .bind(&listing.seller_name)
        .bind(encode_params(&listing.params))
        .bind(listing.is_active.to_db())
        .bind(listing.is_favorite as i64)
        .bind(listing.sent_notification as i64)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            self.verify_written(listing).await?;
            debug!(id = %listing.id, "listing inserted and verified");
        }
        Ok(inserted)
    }

    /// Re-read a just-written row and compare every field to the original.
    pub async fn verify_written(&self, expected: &Listing) -> Result<(), StoreError> {
        let stored = self.get(&expected.id).await?.ok_or(StoreError::Integrity {
            id: expected.id.clone(),
            field: "id",
        })?;
        if let Some(field) = first_mismatch(expected, &stored) {
            return Err(StoreError::Integrity {
                id: expected.id.clone(),
                field,
            });
        }
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Listing>, StoreError> {
        let row = sqlx::query("SELECT * FROM listings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| listing_from_row(&r)).transpose()
    }

    /// Apply an enrichment patch. Absent ids are a no-op. `created_at` is never
    /// written, `is_active` is resolved to active (inactive listings are deleted,
    /// not updated), and `last_full_check` only moves forward.
    pub async fn update_enrichment(
        &self,
        id: &str,
        update: &EnrichmentUpdate,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE listings SET
                description = COALESCE(?1, description),
                full_description = COALESCE(?2, full_description),
                seller_name = COALESCE(?3, seller_name),
                params = COALESCE(?4, params),
                all_photos = COALESCE(?5, all_photos),
                is_active = 1,
                last_full_check = CASE
                    WHEN last_full_check IS NULL OR last_full_check < ?6 THEN ?7
                    ELSE last_full_check
                END
            WHERE id = ?8
            "#,
        )
        .bind(&update.description)
        .bind(&update.full_description)
        .bind(&update.seller_name)
        .bind(update.params.as_ref().map(|p| encode_params(p)))
        .bind(update.all_photos.as_ref().map(|p| encode_photos(p)))
        .bind(encode_ts(update.checked_at))
        .bind(encode_ts(update.checked_at))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Advance `last_full_check` without touching any content field. Used when a
    /// detail page yielded no extraction verdict, so the same broken page is not
    /// re-selected every cycle.
    pub async fn touch_check(&self, id: &str, when: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE listings SET
                last_full_check = CASE
                    WHEN last_full_check IS NULL OR last_full_check < ?1 THEN ?1
                    ELSE last_full_check
                END
            WHERE id = ?2
            "#,
        )
        .bind(encode_ts(when))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete by id; absent ids are a no-op.
    pub async fn delete(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM listings WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn query(&self, query: &ListingQuery) -> Result<Vec<Listing>, StoreError> {
        let mut builder: QueryBuilder<sqlx::Sqlite> =
            QueryBuilder::new("SELECT * FROM listings WHERE 1=1");
        if let Some(min) = query.min_price_uah {
            builder.push(" AND price_uah >= ").push_bind(min);
        }
        if let Some(max) = query.max_price_uah {
            builder.push(" AND price_uah <= ").push_bind(max);
        }
        if let Some(from) = query.created_from {
            builder
                .push(" AND created_at >= ")
                .push_bind(format!("{}T00:00:00", from.format("%Y-%m-%d")));
        }
        if let Some(to) = query.created_to {
            builder
                .push(" AND created_at <= ")
                .push_bind(format!("{}T23:59:59", to.format("%Y-%m-%d")));
        }
        if let Some(text) = query.text.as_deref().filter(|t| !t.trim().is_empty()) {
            let pattern = format!("%{}%", text.trim().to_lowercase());
            builder
                .push(" AND (LOWER(COALESCE(title, '')) LIKE ")
                .push_bind(pattern.clone())
                .push(" OR LOWER(COALESCE(location_raw, '')) LIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if query.favorites_only {
            builder.push(" AND is_favorite = 1");
        }
        builder.push(match query.sort {
            SortOrder::Newest => " ORDER BY created_at DESC",
            SortOrder::PriceAsc => " ORDER BY price_uah ASC",
            SortOrder::PriceDesc => " ORDER BY price_uah DESC",
        });
        builder.push(" LIMIT ").push_bind(query.limit.max(0));
        builder.push(" OFFSET ").push_bind(query.offset.max(0));

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(listing_from_row).collect()
    }

    /// Favorites whose last check is missing or older than `threshold`,
    /// oldest check first (never-checked rows sort first).
    pub async fn favorites_due(
        &self,
        threshold: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM listings
            WHERE is_favorite = 1
              AND (last_full_check IS NULL OR last_full_check < ?)
            ORDER BY last_full_check ASC
            LIMIT ?
            "#,
        )
        .bind(encode_ts(threshold))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    /// Listings never fully enriched, newest first.
    pub async fn never_enriched(&self, limit: i64) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM listings
            WHERE full_description IS NULL OR full_description = '' OR is_active IS NULL
            ORDER BY created_at DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    /// Round-robin sweep over non-favorites, oldest check first.
    pub async fn rotation(&self, limit: i64) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM listings
            WHERE is_favorite = 0
            ORDER BY last_full_check ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    /// Notifier queue: listings not yet dispatched, oldest first.
    pub async fn unsent(&self, limit: i64) -> Result<Vec<Listing>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM listings WHERE sent_notification = 0 ORDER BY created_at ASC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(listing_from_row).collect()
    }

    pub async fn mark_sent(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE listings SET sent_notification = 1 WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Flip the favorite flag, returning the new value, or `None` if the id is
    /// not present.
    pub async fn toggle_favorite(&self, id: &str) -> Result<Option<bool>, StoreError> {
        let result = sqlx::query("UPDATE listings SET is_favorite = 1 - is_favorite WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        let row = sqlx::query("SELECT is_favorite FROM listings WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<i64, _>("is_favorite") != 0))
    }

    /// Retention sweep: delete everything created before `cutoff`, regardless of
    /// activity status. Returns the number of rows removed.
    pub async fn purge_created_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM listings WHERE created_at < ?")
            .bind(encode_ts(cutoff))
            .execute(&self.pool)
            .await?;
        let removed = result.rows_affected();
        if removed > 0 {
            info!(removed, "purged listings past retention");
        }
        Ok(removed)
    }

    pub async fn count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("n"))
    }
}

async fn ensure_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS listings (
            id TEXT PRIMARY KEY,
            title TEXT,
            price_value INTEGER,
            price_currency TEXT,
            price_uah INTEGER,
            price_raw TEXT,
            location_raw TEXT,
            image_url TEXT,
            ad_url TEXT,
            created_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    let existing: Vec<String> = sqlx::query("PRAGMA table_info(listings)")
        .fetch_all(pool)
        .await?
        .iter()
        .map(|row| row.get::<String, _>("name"))
        .collect();

    for (name, decl) in ADDITIVE_COLUMNS {
        if !existing.iter().any(|c| c == name) {
            debug!(column = name, "adding missing column");
            sqlx::query(&format!("ALTER TABLE listings ADD COLUMN {name} {decl}"))
                .execute(pool)
                .await?;
        }
    }
    Ok(())
}

// Nanosecond precision so a wall-clock timestamp reads back bit-identical and
// never trips the write-then-verify comparison.
fn encode_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn encode_params(params: &BTreeMap<String, String>) -> String {
    serde_json::to_string(params).unwrap_or_else(|_| "{}".to_string())
}

fn encode_photos(photos: &[String]) -> String {
    serde_json::to_string(photos).unwrap_or_else(|_| "[]".to_string())
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing, StoreError> {
    let id: String = row.get("id");
    let decode = |reason: String| StoreError::Decode {
        id: id.clone(),
        reason,
    };

    let created_at_raw: Option<String> = row.get("created_at");
    let created_at = created_at_raw
        .as_deref()
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| decode(format!("bad created_at: {created_at_raw:?}")))?;

    let last_full_check = match row.get::<Option<String>, _>("last_full_check") {
        None => None,
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(&raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|err| decode(format!("bad last_full_check: {err}")))?,
        ),
    };

    let params = row
        .get::<Option<String>, _>("params")
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    let all_photos = row
        .get::<Option<String>, _>("all_photos")
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();

    Ok(Listing {
        id: id.clone(),
        title: row.get("title"),
        ad_url: row.get("ad_url"),
        image_url: row.get("image_url"),
        all_photos,
        price_value: row.get("price_value"),
        price_currency: row.get("price_currency"),
        price_uah: row.get("price_uah"),
        price_raw: row.get("price_raw"),
        location_raw: row.get("location_raw"),
        created_at,
        last_full_check,
        description: row.get("description"),
        full_description: row.get("full_description"),
        seller_name: row.get("seller_name"),
        params,
        is_active: ActiveState::from_db(row.get("is_active")),
        is_favorite: row.get::<Option<i64>, _>("is_favorite").unwrap_or(0) != 0,
        sent_notification: row.get::<Option<i64>, _>("sent_notification").unwrap_or(0) != 0,
    })
}

fn first_mismatch(expected: &Listing, stored: &Listing) -> Option<&'static str> {
    if expected.title != stored.title {
        return Some("title");
    }
    if expected.ad_url != stored.ad_url {
        return Some("ad_url");
    }
    if expected.image_url != stored.image_url {
        return Some("image_url");
    }
    if expected.all_photos != stored.all_photos {
        return Some("all_photos");
    }
    if expected.price_value != stored.price_value {
        return Some("price_value");
    }
    if expected.price_currency != stored.price_currency {
        return Some("price_currency");
    }
    if expected.price_uah != stored.price_uah {
        return Some("price_uah");
    }
    if expected.price_raw != stored.price_raw {
        return Some("price_raw");
    }
    if expected.location_raw != stored.location_raw {
        return Some("location_raw");
    }
    if expected.created_at != stored.created_at {
        return Some("created_at");
    }
    if expected.last_full_check != stored.last_full_check {
        return Some("last_full_check");
    }
    if expected.description != stored.description {
        return Some("description");
    }
    if expected.full_description != stored.full_description {
        return Some("full_description");
    }
    if expected.seller_name != stored.seller_name {
        return Some("seller_name");
    }
    if expected.params != stored.params {
        return Some("params");
    }
    if expected.is_active != stored.is_active {
        return Some("is_active");
    }
    if expected.is_favorite != stored.is_favorite {
        return Some("is_favorite");
    }
    if expected.sent_notification != stored.sent_notification {
        return Some("sent_notification");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 20, h, m, 0).single().expect("ts")
    }

    fn sample(id: &str) -> Listing {
        let mut listing = Listing::acquired(id, ts(10, 0));
        listing.title = Some(format!("Listing {id}"));
        listing.ad_url = Some(format!("https://market.example/d/ad/{id}.html"));
        listing.image_url = Some("https://img.example/1;s=640x480".to_string());
        listing.price_value = Some(15000);
        listing.price_currency = Some("UAH".to_string());
        listing.price_uah = Some(15000);
        listing.price_raw = Some(r#"{"value":15000,"currency":"UAH"}"#.to_string());
        listing.location_raw = Some("Київ".to_string());
        listing
    }

    #[tokio::test]
    async fn duplicate_insert_is_reported_not_stored() {
        let store = ListingStore::open_in_memory().await.expect("store");
        let listing = sample("a1");

        assert!(store.upsert_if_absent(&listing).await.expect("first insert"));
        assert!(!store.upsert_if_absent(&listing).await.expect("second insert"));
        assert_eq!(store.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn inserted_row_reads_back_identical() {
        let store = ListingStore::open_in_memory().await.expect("store");
        let mut listing = sample("a2");
        listing.params.insert("Рік випуску".to_string(), "2019".to_string());
        listing.all_photos = vec!["https://img.example/p1;s=1000x750".to_string()];

        store.upsert_if_absent(&listing).await.expect("insert");
        let stored = store.get("a2").await.expect("get").expect("present");
        assert_eq!(stored, listing);
    }

    #[tokio::test]
    async fn wall_clock_timestamps_survive_the_verify_round_trip() {
        let store = ListingStore::open_in_memory().await.expect("store");
        let mut listing = sample("now1");
        listing.created_at = Utc::now();
        listing.last_full_check = Some(Utc::now());

        assert!(store.upsert_if_absent(&listing).await.expect("insert"));
        let stored = store.get("now1").await.expect("get").expect("present");
        assert_eq!(stored.created_at, listing.created_at);
        assert_eq!(stored.last_full_check, listing.last_full_check);
    }

    #[tokio::test]
    async fn corrupted_row_raises_integrity_failure() {
        let store = ListingStore::open_in_memory().await.expect("store");
        let listing = sample("a3");
        store.upsert_if_absent(&listing).await.expect("insert");

        sqlx::query("UPDATE listings SET title = 'mangled' WHERE id = 'a3'")
            .execute(store.pool())
            .await
            .expect("corrupt");

        let err = store.verify_written(&listing).await.expect_err("must fail");
        match err {
            StoreError::Integrity { id, field } => {
                assert_eq!(id, "a3");
                assert_eq!(field, "title");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn enrichment_preserves_created_at_and_is_monotonic() {
        let store = ListingStore::open_in_memory().await.expect("store");
        let listing = sample("a4");
        store.upsert_if_absent(&listing).await.expect("insert");

        let mut update = EnrichmentUpdate::at(ts(12, 0));
        update.full_description = Some("full text".to_string());
        update.seller_name = Some("Oleh".to_string());
        store.update_enrichment("a4", &update).await.expect("update");

        // A later patch with an older timestamp must not move the check back.
        let stale = EnrichmentUpdate::at(ts(11, 0));
        store.update_enrichment("a4", &stale).await.expect("stale update");

        let stored = store.get("a4").await.expect("get").expect("present");
        assert_eq!(stored.created_at, listing.created_at);
        assert_eq!(stored.last_full_check, Some(ts(12, 0)));
        assert_eq!(stored.full_description.as_deref(), Some("full text"));
        assert_eq!(stored.seller_name.as_deref(), Some("Oleh"));
        assert_eq!(stored.is_active, ActiveState::Active);
    }

    #[tokio::test]
    async fn partial_update_leaves_other_fields_alone() {
        let store = ListingStore::open_in_memory().await.expect("store");
        store.upsert_if_absent(&sample("a5")).await.expect("insert");

        let mut first = EnrichmentUpdate::at(ts(12, 0));
        first.seller_name = Some("Iryna".to_string());
        first.all_photos = Some(vec!["https://img.example/x".to_string()]);
        store.update_enrichment("a5", &first).await.expect("first");

        let mut second = EnrichmentUpdate::at(ts(13, 0));
        second.description = Some("shorter".to_string());
        store.update_enrichment("a5", &second).await.expect("second");

        let stored = store.get("a5").await.expect("get").expect("present");
        assert_eq!(stored.seller_name.as_deref(), Some("Iryna"));
        assert_eq!(stored.all_photos, vec!["https://img.example/x".to_string()]);
        assert_eq!(stored.description.as_deref(), Some("shorter"));
    }

    #[tokio::test]
    async fn update_and_delete_on_missing_id_are_no_ops() {
        let store = ListingStore::open_in_memory().await.expect("store");
        let update = EnrichmentUpdate::at(ts(12, 0));
        store.update_enrichment("ghost", &update).await.expect("update");
        store.delete("ghost").await.expect("delete");
        store.mark_sent("ghost").await.expect("mark");
        assert_eq!(store.count().await.expect("count"), 0);
    }

    #[tokio::test]
    async fn query_filters_and_sorts() {
        let store = ListingStore::open_in_memory().await.expect("store");
        for (id, price, title) in [
            ("q1", 10_000, "BMW 320"),
            ("q2", 50_000, "Audi A4"),
            ("q3", 90_000, "BMW 530 Київ"),
        ] {
            let mut listing = sample(id);
            listing.price_uah = Some(price);
            listing.title = Some(title.to_string());
            store.upsert_if_absent(&listing).await.expect("insert");
        }

        let cheap = store
            .query(&ListingQuery {
                max_price_uah: Some(60_000),
                sort: SortOrder::PriceAsc,
                ..Default::default()
            })
            .await
            .expect("query");
        assert_eq!(
            cheap.iter().map(|l| l.id.as_str()).collect::<Vec<_>>(),
            vec!["q1", "q2"]
        );

        let bmw = store
            .query(&ListingQuery {
                text: Some("bmw".to_string()),
                sort: SortOrder::PriceDesc,
                ..Default::default()
            })
            .await
            .expect("query");
        assert_eq!(
            bmw.iter().map(|l| l.id.as_str()).collect::<Vec<_>>(),
            vec!["q3", "q1"]
        );
    }

    #[tokio::test]
    async fn favorite_toggle_round_trips_and_reports_absent() {
        let store = ListingStore::open_in_memory().await.expect("store");
        store.upsert_if_absent(&sample("f1")).await.expect("insert");

        assert_eq!(store.toggle_favorite("f1").await.expect("toggle"), Some(true));
        assert_eq!(store.toggle_favorite("f1").await.expect("toggle"), Some(false));
        assert_eq!(store.toggle_favorite("nope").await.expect("toggle"), None);
    }

    #[tokio::test]
    async fn notifier_queue_marks_sent() {
        let store = ListingStore::open_in_memory().await.expect("store");
        store.upsert_if_absent(&sample("n1")).await.expect("insert");
        store.upsert_if_absent(&sample("n2")).await.expect("insert");

        let unsent = store.unsent(10).await.expect("unsent");
        assert_eq!(unsent.len(), 2);

        store.mark_sent("n1").await.expect("mark");
        let unsent = store.unsent(10).await.expect("unsent");
        assert_eq!(unsent.len(), 1);
        assert_eq!(unsent[0].id, "n2");
    }

    #[tokio::test]
    async fn retention_purge_ignores_activity() {
        let store = ListingStore::open_in_memory().await.expect("store");
        let mut old = sample("old");
        old.created_at = ts(1, 0);
        let mut fresh = sample("fresh");
        fresh.created_at = ts(10, 0);
        store.upsert_if_absent(&old).await.expect("insert");
        store.upsert_if_absent(&fresh).await.expect("insert");

        let mut update = EnrichmentUpdate::at(ts(11, 0));
        update.full_description = Some("still live".to_string());
        store.update_enrichment("old", &update).await.expect("update");

        let removed = store.purge_created_before(ts(5, 0)).await.expect("purge");
        assert_eq!(removed, 1);
        assert!(store.get("old").await.expect("get").is_none());
        assert!(store.get("fresh").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn schema_bootstrap_extends_first_generation_table() {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await
            .expect("pool");

        sqlx::query(
            r#"
            CREATE TABLE listings (
                id TEXT PRIMARY KEY,
                title TEXT,
                price_value INTEGER,
                price_currency TEXT,
                price_uah INTEGER,
                price_raw TEXT,
                location_raw TEXT,
                image_url TEXT,
                ad_url TEXT,
                created_at TEXT
            )
            "#,
        )
        .execute(&pool)
        .await
        .expect("old table");
        sqlx::query(
            "INSERT INTO listings (id, title, created_at) VALUES ('legacy', 'Old row', ?)",
        )
        .bind(encode_ts(ts(2, 0)))
        .execute(&pool)
        .await
        .expect("legacy row");

        let store = ListingStore::from_pool(pool).await.expect("bootstrap");
        let legacy = store.get("legacy").await.expect("get").expect("present");
        assert_eq!(legacy.is_active, ActiveState::Unknown);
        assert!(!legacy.is_favorite);
        assert!(legacy.last_full_check.is_none());

        // New-generation rows write cleanly into the migrated table.
        let mut listing = sample("new");
        listing.params.insert("Fuel".to_string(), "Petrol".to_string());
        assert!(store.upsert_if_absent(&listing).await.expect("insert"));
    }

    #[tokio::test]
    async fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("snapshot.db");

        {
            let store = ListingStore::open(&path).await.expect("open");
            store.upsert_if_absent(&sample("d1")).await.expect("insert");
        }

        let store = ListingStore::open(&path).await.expect("reopen");
        assert!(store.get("d1").await.expect("get").is_some());
    }
}
