use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::normalize::normalize;
use crate::osm::{Pacer, RawElement, ReverseGeocode, SourceFetch};
use crate::store::{RecordFailure, ShopStore};

const STALE_REFRESH_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct ImportMode {
    pub update_existing: bool,
    /// Cost-control cutoff applied to the fetched set before any identity
    /// lookups; provider fetch order is kept.
    pub max_records: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionOutcome {
    pub region: String,
    pub new_shops: usize,
    pub updated_shops: usize,
    pub skipped_shops: usize,
    pub errors: Vec<RecordFailure>,
    pub duration_ms: u64,
}

impl RegionOutcome {
    fn empty(region: &str) -> Self {
        Self {
            region: region.to_string(),
            new_shops: 0,
            updated_shops: 0,
            skipped_shops: 0,
            errors: Vec::new(),
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshOutcome {
    pub updated: usize,
    pub errors: Vec<RecordFailure>,
}

enum RecordAction {
    Inserted,
    Updated,
    Skipped,
}

/// Drives the upsert loop for one region at a time. Partial failure never
/// aborts a batch: record-level errors land in the outcome's error list and
/// the loop moves on.
pub struct ReconcileEngine {
    source: Arc<dyn SourceFetch>,
    geocoder: Arc<dyn ReverseGeocode>,
    store: ShopStore,
    record_pacer: Pacer,
    geocode_pacer: Pacer,
}

impl ReconcileEngine {
    pub fn new(
        store: ShopStore,
        source: Arc<dyn SourceFetch>,
        geocoder: Arc<dyn ReverseGeocode>,
        config: &AppConfig,
    ) -> Self {
        Self {
            source,
            geocoder,
            store,
            record_pacer: Pacer::new(config.record_delay_ms),
            geocode_pacer: Pacer::new(config.geocode_delay_ms),
        }
    }

    pub async fn process_region(&self, region_code: &str, mode: &ImportMode) -> RegionOutcome {
        let started = Instant::now();
        let mut outcome = RegionOutcome::empty(region_code);

        let elements = match self.source.fetch_region(region_code).await {
            Ok(elements) => elements,
            Err(err) => {
                warn!(region = region_code, %err, "region fetch failed");
                outcome
                    .errors
                    .push(RecordFailure::new(region_code, err.to_string()));
                outcome.duration_ms = started.elapsed().as_millis() as u64;
                return outcome;
            }
        };
        info!(
            region = region_code,
            found = elements.len(),
            "fetched shops from OpenStreetMap"
        );

        let cap = mode.max_records.unwrap_or(elements.len());
        for element in elements.iter().take(cap) {
            // paced even when the previous record failed
            self.record_pacer.wait().await;
            match self.reconcile_element(element, region_code, mode).await {
                Ok(RecordAction::Inserted) => outcome.new_shops += 1,
                Ok(RecordAction::Updated) => outcome.updated_shops += 1,
                Ok(RecordAction::Skipped) => outcome.skipped_shops += 1,
                Err(AppError::MissingCoordinate(_)) => outcome.skipped_shops += 1,
                Err(err) => outcome
                    .errors
                    .push(RecordFailure::new(record_label(element), err.to_string())),
            }
        }

        outcome.duration_ms = started.elapsed().as_millis() as u64;
        outcome
    }

    async fn reconcile_element(
        &self,
        element: &RawElement,
        region_code: &str,
        mode: &ImportMode,
    ) -> AppResult<RecordAction> {
        let external_id = element.external_id();
        let exists = self.store.exists(&external_id)?;
        let shop = normalize(
            element,
            region_code,
            exists,
            self.geocoder.as_ref(),
            &self.geocode_pacer,
        )
        .await?;

        if exists {
            if mode.update_existing {
                self.store.update(&external_id, &shop)?;
                Ok(RecordAction::Updated)
            } else {
                Ok(RecordAction::Skipped)
            }
        } else {
            self.store.insert(&shop)?;
            Ok(RecordAction::Inserted)
        }
    }

    /// Re-geocodes listings whose `updated_at` is older than the threshold
    /// and bumps their timestamp when the lookup succeeds. The fresh address
    /// is deliberately not written back; this sweep only proves liveness.
    pub async fn refresh_stale(&self, max_age_days: i64) -> RefreshOutcome {
        let mut outcome = RefreshOutcome {
            updated: 0,
            errors: Vec::new(),
        };

        let cutoff = Utc::now() - Duration::days(max_age_days);
        let stale = match self.store.stale_before(cutoff, STALE_REFRESH_LIMIT) {
            Ok(stale) => stale,
            Err(err) => {
                outcome
                    .errors
                    .push(RecordFailure::new("stale query", err.to_string()));
                return outcome;
            }
        };
        info!(count = stale.len(), max_age_days, "refreshing stale listings");

        for shop in stale {
            let (lat, lon) = match (shop.latitude, shop.longitude) {
                (Some(lat), Some(lon)) => (lat, lon),
                _ => {
                    outcome.errors.push(RecordFailure::new(
                        shop.name.clone(),
                        "listing has no stored coordinate",
                    ));
                    continue;
                }
            };

            self.geocode_pacer.wait().await;
            match self.geocoder.reverse(lat, lon).await {
                Some(_) => match self.store.touch(&shop.osm_id) {
                    Ok(()) => outcome.updated += 1,
                    Err(err) => outcome
                        .errors
                        .push(RecordFailure::new(shop.name.clone(), err.to_string())),
                },
                None => outcome.errors.push(RecordFailure::new(
                    shop.name.clone(),
                    "reverse geocode returned no data",
                )),
            }
        }

        outcome
    }

    pub fn store(&self) -> &ShopStore {
        &self.store
    }
}

fn record_label(element: &RawElement) -> String {
    element
        .tags
        .name
        .clone()
        .unwrap_or_else(|| format!("Shop {}", element.id))
}
