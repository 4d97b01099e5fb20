use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::config::AppConfig;
use crate::osm::Pacer;
use crate::reconcile::{ImportMode, ReconcileEngine, RegionOutcome};

/// Fixed, ordered catalog of EU region codes the scheduled agent walks.
pub const REGION_CATALOG: [&str; 27] = [
    "AT", "BE", "BG", "HR", "CY", "CZ", "DK", "EE", "FI", "FR", "DE", "GR", "HU", "IE", "IT",
    "LV", "LT", "LU", "MT", "NL", "PL", "PT", "RO", "SK", "SI", "ES", "SE",
];

const DAY_WINDOW_START_HOUR: u32 = 3;
const DAY_WINDOW_END_HOUR: u32 = 15;
const DAY_WINDOW_LEN: usize = 13;

/// Day/night split of the catalog. The two windows are disjoint and together
/// cover every region, so two scheduled invocations per day walk the whole
/// catalog.
pub fn window_for_hour(utc_hour: u32) -> &'static [&'static str] {
    if (DAY_WINDOW_START_HOUR..DAY_WINDOW_END_HOUR).contains(&utc_hour) {
        &REGION_CATALOG[..DAY_WINDOW_LEN]
    } else {
        &REGION_CATALOG[DAY_WINDOW_LEN..]
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub new_shops: usize,
    pub updated_shops: usize,
    pub skipped_shops: usize,
    pub errors: usize,
    pub duration_ms: u64,
}

impl RunSummary {
    fn absorb(&mut self, outcome: &RegionOutcome) {
        self.new_shops += outcome.new_shops;
        self.updated_shops += outcome.updated_shops;
        self.skipped_shops += outcome.skipped_shops;
        self.errors += outcome.errors.len();
        self.duration_ms += outcome.duration_ms;
    }
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub results: Vec<RegionOutcome>,
    pub summary: RunSummary,
}

/// Drives reconciliation across a set of regions, one at a time, with
/// mandatory pacing between regions regardless of how each one fared.
pub struct Orchestrator {
    engine: Arc<ReconcileEngine>,
    region_pacer: Pacer,
    max_shops_per_region: usize,
}

impl Orchestrator {
    pub fn new(engine: Arc<ReconcileEngine>, config: &AppConfig) -> Self {
        Self {
            engine,
            region_pacer: Pacer::new(config.region_delay_ms),
            max_shops_per_region: config.cron_max_shops_per_region,
        }
    }

    pub async fn run_regions<S: AsRef<str>>(&self, regions: &[S], mode: &ImportMode) -> RunReport {
        let mut results = Vec::with_capacity(regions.len());
        let mut summary = RunSummary::default();

        for region in regions {
            let region = region.as_ref();
            self.region_pacer.wait().await;
            let outcome = self.engine.process_region(region, mode).await;
            info!(
                region,
                new = outcome.new_shops,
                updated = outcome.updated_shops,
                skipped = outcome.skipped_shops,
                errors = outcome.errors.len(),
                duration_ms = outcome.duration_ms,
                "region complete"
            );
            summary.absorb(&outcome);
            results.push(outcome);
        }

        info!(
            new = summary.new_shops,
            updated = summary.updated_shops,
            skipped = summary.skipped_shops,
            errors = summary.errors,
            "run complete"
        );
        RunReport { results, summary }
    }

    /// Scheduled, time-boxed invocation: the active window with a
    /// conservative per-region record cap.
    pub async fn run_window(&self, utc_hour: u32) -> RunReport {
        let regions = window_for_hour(utc_hour);
        info!(utc_hour, regions = regions.len(), "starting windowed batch");
        let mode = ImportMode {
            update_existing: true,
            max_records: Some(self.max_shops_per_region),
        };
        self.run_regions(regions, &mode).await
    }

    pub fn engine(&self) -> &ReconcileEngine {
        &self.engine
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    use crate::db::bootstrap;
    use crate::errors::{AppError, AppResult};
    use crate::osm::{ElementKind, GeocodedAddress, RawElement, ReverseGeocode, ShopTags, SourceFetch};
    use crate::store::ShopStore;

    use super::*;

    #[test]
    fn two_windows_cover_the_catalog_exactly_once() {
        let day: BTreeSet<&str> = window_for_hour(5).iter().copied().collect();
        let night: BTreeSet<&str> = window_for_hour(20).iter().copied().collect();

        assert!(day.is_disjoint(&night));
        let union: BTreeSet<&str> = day.union(&night).copied().collect();
        assert_eq!(union.len(), REGION_CATALOG.len());
    }

    #[test]
    fn window_boundaries_split_at_three_and_fifteen() {
        assert_eq!(window_for_hour(2), window_for_hour(20));
        assert_eq!(window_for_hour(3), window_for_hour(14));
        assert_eq!(window_for_hour(15), window_for_hour(23));
        assert_ne!(window_for_hour(3), window_for_hour(15));
        assert_eq!(window_for_hour(5).len(), 13);
        assert_eq!(window_for_hour(20).len(), 14);
    }

    struct RegionScriptedSource;

    #[async_trait]
    impl SourceFetch for RegionScriptedSource {
        async fn fetch_region(&self, region_code: &str) -> AppResult<Vec<RawElement>> {
            if region_code == "FR" {
                return Err(AppError::SourceUnavailable("connection reset".into()));
            }
            // Distinct element id per two-letter region code.
            let id = region_code
                .bytes()
                .fold(0i64, |acc, byte| acc * 256 + i64::from(byte));
            Ok(vec![RawElement {
                kind: ElementKind::Node,
                id,
                lat: Some(59.3),
                lon: Some(18.1),
                center: None,
                tags: ShopTags {
                    name: Some(format!("{region_code} Garage")),
                    city: Some("Town".into()),
                    ..ShopTags::default()
                },
            }])
        }
    }

    struct NoGeocoder;

    #[async_trait]
    impl ReverseGeocode for NoGeocoder {
        async fn reverse(&self, _lat: f64, _lon: f64) -> Option<GeocodedAddress> {
            None
        }
    }

    fn scripted_orchestrator(dir: &std::path::Path) -> Orchestrator {
        let ctx = bootstrap(dir, "agent.db").unwrap();
        let config = AppConfig::for_tests();
        let store = ShopStore::new(std::sync::Arc::new(Mutex::new(ctx.connection)), &config);
        let engine = Arc::new(ReconcileEngine::new(
            store,
            Arc::new(RegionScriptedSource),
            Arc::new(NoGeocoder),
            &config,
        ));
        Orchestrator::new(engine, &config)
    }

    #[tokio::test]
    async fn failing_region_does_not_stop_the_run() {
        let dir = tempdir().unwrap();
        let orchestrator = scripted_orchestrator(dir.path());

        let mode = ImportMode {
            update_existing: false,
            max_records: Some(30),
        };
        let report = orchestrator.run_regions(&["FR", "SE", "DE"], &mode).await;

        assert_eq!(report.results.len(), 3);
        let failed = &report.results[0];
        assert_eq!(failed.region, "FR");
        assert_eq!(failed.new_shops, 0);
        assert_eq!(failed.errors.len(), 1);
        assert_eq!(failed.errors[0].label, "FR");

        assert_eq!(report.results[1].new_shops, 1);
        assert_eq!(report.results[2].new_shops, 1);
        assert_eq!(report.summary.new_shops, 2);
        assert_eq!(report.summary.errors, 1);
    }

    #[tokio::test]
    async fn run_window_walks_the_active_regions() {
        let dir = tempdir().unwrap();
        let orchestrator = scripted_orchestrator(dir.path());

        // The day window contains FR, which the scripted source fails.
        let day = orchestrator.run_window(5).await;
        assert_eq!(day.results.len(), 13);
        assert_eq!(day.summary.new_shops, 12);
        assert_eq!(day.summary.errors, 1);

        let night = orchestrator.run_window(20).await;
        assert_eq!(night.results.len(), 14);
        assert_eq!(night.summary.new_shops, 14);
        assert_eq!(night.summary.errors, 0);
    }
}
