mod agent;
mod config;
mod db;
mod errors;
mod normalize;
mod osm;
mod reconcile;
mod store;
mod triggers;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use agent::{window_for_hour, Orchestrator, RunReport, RunSummary, REGION_CATALOG};
pub use config::{AppConfig, PublicAppConfig};
pub use db::bootstrap;
pub use errors::{AppError, AppResult};
pub use normalize::{contact_info, extract_services, format_address, normalize, NewShop};
pub use osm::{
    ElementKind, GeocodedAddress, NominatimClient, OverpassClient, Pacer, RawElement,
    ReverseGeocode, ShopTags, SourceFetch,
};
pub use reconcile::{ImportMode, ReconcileEngine, RefreshOutcome, RegionOutcome};
pub use store::{BatchInsertReport, RecordFailure, ShopRecord, ShopStore, StoreStats};
pub use triggers::{
    import_region, run_agent, scheduled_batch, AgentRequest, AgentResponse, DEFAULT_REFRESH_DAYS,
};

/// Everything a process needs to run the pipeline, constructed once and
/// passed around explicitly.
pub struct AppState {
    config: AppConfig,
    db_path: PathBuf,
    store: ShopStore,
    engine: Arc<ReconcileEngine>,
    orchestrator: Orchestrator,
}

#[derive(Debug, Serialize)]
pub struct ServiceHealth {
    pub db_path: String,
    pub total_shops: usize,
    pub config: PublicAppConfig,
}

impl AppState {
    pub fn initialize<P: AsRef<Path>>(data_dir: P) -> AppResult<Self> {
        init_tracing();
        let config = AppConfig::from_env();
        Self::with_config(data_dir, config)
    }

    pub fn with_config<P: AsRef<Path>>(data_dir: P, config: AppConfig) -> AppResult<Self> {
        let context = bootstrap(data_dir, &config.database_file_name)?;
        let db = Arc::new(Mutex::new(context.connection));
        let store = ShopStore::new(Arc::clone(&db), &config);

        let source = Arc::new(OverpassClient::new(&config)?);
        let geocoder = Arc::new(NominatimClient::new(&config)?);
        let engine = Arc::new(ReconcileEngine::new(
            store.clone(),
            source,
            geocoder,
            &config,
        ));
        let orchestrator = Orchestrator::new(Arc::clone(&engine), &config);

        Ok(Self {
            config,
            db_path: context.path,
            store,
            engine,
            orchestrator,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &ShopStore {
        &self.store
    }

    pub fn engine(&self) -> &ReconcileEngine {
        &self.engine
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn health(&self) -> AppResult<ServiceHealth> {
        Ok(ServiceHealth {
            db_path: self.db_path.to_string_lossy().to_string(),
            total_shops: self.store.stats()?.total,
            config: self.config.public_profile(),
        })
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,moto_shop_sync=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
