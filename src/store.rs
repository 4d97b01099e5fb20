use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tokio::time::sleep;
use tracing::trace;

use crate::config::AppConfig;
use crate::db::format_timestamp;
use crate::errors::{AppError, AppResult};
use crate::normalize::NewShop;

#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    pub label: String,
    pub message: String,
}

impl RecordFailure {
    pub fn new(label: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShopRecord {
    pub id: i64,
    pub osm_id: String,
    pub osm_type: String,
    pub name: String,
    pub description: Option<String>,
    pub street_address: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    pub country_code: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub opening_hours: Option<String>,
    pub services: Vec<String>,
    pub verified: bool,
    pub rating: Option<f64>,
    pub review_count: i64,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub by_country: BTreeMap<String, usize>,
    pub verified: usize,
    pub with_website: usize,
    pub with_phone: usize,
}

#[derive(Debug, Serialize)]
pub struct BatchInsertReport {
    pub inserted: usize,
    pub chunks: usize,
    pub errors: Vec<RecordFailure>,
}

const SHOP_COLUMNS: &str = "id, osm_id, osm_type, name, description, street_address, postal_code,
    city, country, country_code, latitude, longitude, phone, email, website,
    opening_hours, services, verified, rating, review_count, created_at, updated_at";

/// Persistence gateway for the `repair_shops` table.
#[derive(Clone)]
pub struct ShopStore {
    db: Arc<Mutex<Connection>>,
    chunk_size: usize,
    chunk_delay_ms: u64,
}

impl ShopStore {
    pub fn new(db: Arc<Mutex<Connection>>, config: &AppConfig) -> Self {
        Self {
            db,
            chunk_size: config.batch_chunk_size.max(1),
            chunk_delay_ms: config.chunk_delay_ms,
        }
    }

    /// Existence check only; never loads the full row.
    pub fn exists(&self, osm_id: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM repair_shops WHERE osm_id = ?1 LIMIT 1",
                [osm_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn insert(&self, shop: &NewShop) -> AppResult<i64> {
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO repair_shops (
                osm_id, osm_type, name, description, street_address, postal_code,
                city, country, country_code, latitude, longitude, phone, email,
                website, opening_hours, services, verified, rating, review_count
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
            params![
                shop.osm_id,
                shop.osm_type,
                shop.name,
                shop.description,
                shop.street_address,
                shop.postal_code,
                shop.city,
                shop.country,
                shop.country_code,
                shop.latitude,
                shop.longitude,
                shop.phone,
                shop.email,
                shop.website,
                shop.opening_hours,
                encode_services(&shop.services),
                shop.verified as i64,
                shop.rating,
                shop.review_count,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Full overwrite of the mutable fields. `osm_id`, `osm_type`,
    /// `country_code`, the verification flag and the rating columns are left
    /// untouched; the store refreshes `updated_at` itself.
    pub fn update(&self, osm_id: &str, shop: &NewShop) -> AppResult<()> {
        let conn = self.db.lock();
        let changed = conn.execute(
            "UPDATE repair_shops SET
                name = ?2,
                description = ?3,
                street_address = ?4,
                postal_code = ?5,
                city = ?6,
                country = ?7,
                latitude = ?8,
                longitude = ?9,
                phone = ?10,
                email = ?11,
                website = ?12,
                opening_hours = ?13,
                services = ?14,
                updated_at = DATETIME('now')
            WHERE osm_id = ?1",
            params![
                osm_id,
                shop.name,
                shop.description,
                shop.street_address,
                shop.postal_code,
                shop.city,
                shop.country,
                shop.latitude,
                shop.longitude,
                shop.phone,
                shop.email,
                shop.website,
                shop.opening_hours,
                encode_services(&shop.services),
            ],
        )?;
        if changed == 0 {
            return Err(AppError::Config(format!(
                "no listing found for external id {osm_id}"
            )));
        }
        Ok(())
    }

    /// Timestamp bump without touching any data column.
    pub fn touch(&self, osm_id: &str) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE repair_shops SET updated_at = DATETIME('now') WHERE osm_id = ?1",
            [osm_id],
        )?;
        Ok(())
    }

    /// Chunked insert with inter-chunk pacing. A failing item is reported
    /// individually and does not block its chunk siblings.
    pub async fn batch_insert(&self, shops: &[NewShop]) -> BatchInsertReport {
        let mut report = BatchInsertReport {
            inserted: 0,
            chunks: 0,
            errors: Vec::new(),
        };

        for chunk in shops.chunks(self.chunk_size) {
            report.chunks += 1;
            for shop in chunk {
                match self.insert(shop) {
                    Ok(_) => report.inserted += 1,
                    Err(err) => report
                        .errors
                        .push(RecordFailure::new(shop.name.clone(), err.to_string())),
                }
            }
            trace!(chunk = report.chunks, inserted = report.inserted, "batch chunk written");
            sleep(Duration::from_millis(self.chunk_delay_ms)).await;
        }

        report
    }

    pub fn all_by_rating(&self) -> AppResult<Vec<ShopRecord>> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {SHOP_COLUMNS} FROM repair_shops ORDER BY rating IS NULL, rating DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], parse_shop_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn by_country(&self, country_code: &str) -> AppResult<Vec<ShopRecord>> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {SHOP_COLUMNS} FROM repair_shops
            WHERE country_code = ?1
            ORDER BY rating IS NULL, rating DESC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([country_code], parse_shop_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Listings whose `updated_at` predates the cutoff, oldest first.
    pub fn stale_before(&self, cutoff: DateTime<Utc>, limit: usize) -> AppResult<Vec<ShopRecord>> {
        let conn = self.db.lock();
        let sql = format!(
            "SELECT {SHOP_COLUMNS} FROM repair_shops
            WHERE updated_at < ?1
            ORDER BY updated_at ASC
            LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(
                params![format_timestamp(cutoff), limit as i64],
                parse_shop_row,
            )?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Administrative removal; never invoked by the reconciliation pipeline.
    pub fn delete(&self, osm_id: &str) -> AppResult<()> {
        let conn = self.db.lock();
        conn.execute("DELETE FROM repair_shops WHERE osm_id = ?1", [osm_id])?;
        Ok(())
    }

    /// Aggregate statistics, derived on demand.
    pub fn stats(&self) -> AppResult<StoreStats> {
        let conn = self.db.lock();
        let (total, verified, with_website, with_phone) = conn.query_row(
            "SELECT
                COUNT(*),
                COALESCE(SUM(verified), 0),
                COALESCE(SUM(website IS NOT NULL AND website != ''), 0),
                COALESCE(SUM(phone IS NOT NULL AND phone != ''), 0)
            FROM repair_shops",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            },
        )?;

        let mut by_country = BTreeMap::new();
        let mut stmt =
            conn.prepare("SELECT country_code, COUNT(*) FROM repair_shops GROUP BY country_code")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let code: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            by_country.insert(code, count as usize);
        }

        Ok(StoreStats {
            total: total as usize,
            by_country,
            verified: verified as usize,
            with_website: with_website as usize,
            with_phone: with_phone as usize,
        })
    }
}

impl ShopStore {
    #[cfg(test)]
    pub fn backdate(&self, osm_id: &str, updated_at: &str) {
        let conn = self.db.lock();
        conn.execute(
            "UPDATE repair_shops SET updated_at = ?2 WHERE osm_id = ?1",
            params![osm_id, updated_at],
        )
        .unwrap();
    }
}

fn encode_services(services: &[String]) -> Option<String> {
    if services.is_empty() {
        None
    } else {
        Some(serde_json::to_string(services).unwrap_or_default())
    }
}

fn decode_services(value: Option<String>) -> Vec<String> {
    value
        .and_then(|text| serde_json::from_str::<Vec<String>>(&text).ok())
        .unwrap_or_default()
}

fn parse_shop_row(row: &Row<'_>) -> rusqlite::Result<ShopRecord> {
    Ok(ShopRecord {
        id: row.get(0)?,
        osm_id: row.get(1)?,
        osm_type: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        street_address: row.get(5)?,
        postal_code: row.get(6)?,
        city: row.get(7)?,
        country: row.get(8)?,
        country_code: row.get(9)?,
        latitude: row.get(10)?,
        longitude: row.get(11)?,
        phone: row.get(12)?,
        email: row.get(13)?,
        website: row.get(14)?,
        opening_hours: row.get(15)?,
        services: decode_services(row.get(16)?),
        verified: row.get::<_, i64>(17)? != 0,
        rating: row.get(18)?,
        review_count: row.get(19)?,
        created_at: row.get(20)?,
        updated_at: row.get(21)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use tempfile::tempdir;

    use crate::db::bootstrap;

    use super::*;

    fn test_store() -> (tempfile::TempDir, ShopStore) {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path(), "store.db").unwrap();
        let store = ShopStore::new(
            Arc::new(Mutex::new(ctx.connection)),
            &AppConfig::for_tests(),
        );
        (dir, store)
    }

    fn sample_shop(osm_id: &str, name: &str, country_code: &str) -> NewShop {
        NewShop {
            name: name.to_string(),
            description: Some("Motorcycle repair shop from OpenStreetMap".into()),
            street_address: Some("Kungsgatan 4".into()),
            postal_code: Some("111 43".into()),
            city: Some("Stockholm".into()),
            country: Some("Sweden".into()),
            country_code: country_code.to_string(),
            latitude: Some(59.3),
            longitude: Some(18.1),
            phone: Some("+46 8 123".into()),
            email: None,
            website: Some("https://shop.example.se".into()),
            opening_hours: Some("Mo-Fr 08:00-17:00".into()),
            services: vec!["Repair".into(), "Tyre Change".into()],
            verified: false,
            rating: None,
            review_count: 0,
            osm_id: osm_id.to_string(),
            osm_type: "node".to_string(),
        }
    }

    #[test]
    fn insert_then_exists_then_delete() {
        let (_dir, store) = test_store();
        assert!(!store.exists("node42").unwrap());
        store.insert(&sample_shop("node42", "Oslo Garage", "SE")).unwrap();
        assert!(store.exists("node42").unwrap());
        store.delete("node42").unwrap();
        assert!(!store.exists("node42").unwrap());
    }

    #[test]
    fn update_overwrites_mutable_fields_only() {
        let (_dir, store) = test_store();
        store.insert(&sample_shop("node42", "Oslo Garage", "SE")).unwrap();

        let mut changed = sample_shop("node42", "Renamed Garage", "NO");
        changed.city = Some("Oslo".into());
        changed.services = vec!["Repair".into()];
        store.update("node42", &changed).unwrap();

        let rows = store.by_country("SE").unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.name, "Renamed Garage");
        assert_eq!(row.city.as_deref(), Some("Oslo"));
        assert_eq!(row.services, vec!["Repair".to_string()]);
        // identity and region are immutable through update
        assert_eq!(row.osm_id, "node42");
        assert_eq!(row.country_code, "SE");
    }

    #[test]
    fn update_of_unknown_id_is_an_error() {
        let (_dir, store) = test_store();
        let err = store
            .update("node404", &sample_shop("node404", "Ghost", "SE"))
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn batch_insert_chunks_and_isolates_failures() {
        let (_dir, store) = test_store();

        let mut shops = Vec::new();
        for i in 0..120 {
            shops.push(sample_shop(&format!("node{i}"), &format!("Shop {i}"), "SE"));
        }
        // duplicate external id inside the second chunk
        shops[70] = sample_shop("node0", "Duplicate", "SE");

        let report = store.batch_insert(&shops).await;
        assert_eq!(report.chunks, 3);
        assert_eq!(report.inserted, 119);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].label, "Duplicate");
    }

    #[test]
    fn orders_ratings_descending_with_nulls_last() {
        let (_dir, store) = test_store();
        store.insert(&sample_shop("node1", "Unrated", "SE")).unwrap();
        let mut rated = sample_shop("node2", "Rated", "SE");
        rated.rating = Some(4.5);
        store.insert(&rated).unwrap();
        let mut low = sample_shop("node3", "Low", "SE");
        low.rating = Some(2.0);
        store.insert(&low).unwrap();

        let rows = store.all_by_rating().unwrap();
        let names: Vec<&str> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["Rated", "Low", "Unrated"]);
    }

    #[test]
    fn stale_query_returns_oldest_first() {
        let (_dir, store) = test_store();
        store.insert(&sample_shop("node1", "Old", "SE")).unwrap();
        store.insert(&sample_shop("node2", "Older", "SE")).unwrap();
        store.insert(&sample_shop("node3", "Fresh", "SE")).unwrap();

        {
            let conn = store.db.lock();
            conn.execute(
                "UPDATE repair_shops SET updated_at = '2024-01-10 00:00:00' WHERE osm_id = 'node1'",
                [],
            )
            .unwrap();
            conn.execute(
                "UPDATE repair_shops SET updated_at = '2024-01-05 00:00:00' WHERE osm_id = 'node2'",
                [],
            )
            .unwrap();
        }

        let cutoff = Utc::now() - ChronoDuration::days(30);
        let stale = store.stale_before(cutoff, 100).unwrap();
        let ids: Vec<&str> = stale.iter().map(|r| r.osm_id.as_str()).collect();
        assert_eq!(ids, vec!["node2", "node1"]);

        let limited = store.stale_before(cutoff, 1).unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].osm_id, "node2");
    }

    #[test]
    fn stats_are_derived_on_demand() {
        let (_dir, store) = test_store();
        store.insert(&sample_shop("node1", "A", "SE")).unwrap();
        store.insert(&sample_shop("node2", "B", "SE")).unwrap();
        let mut bare = sample_shop("node3", "C", "DE");
        bare.website = None;
        bare.phone = None;
        store.insert(&bare).unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_country.get("SE"), Some(&2));
        assert_eq!(stats.by_country.get("DE"), Some(&1));
        assert_eq!(stats.verified, 0);
        assert_eq!(stats.with_website, 2);
        assert_eq!(stats.with_phone, 2);
    }
}
