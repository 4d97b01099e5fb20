use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

const DEFAULT_OVERPASS_ENDPOINT: &str = "https://overpass-api.de/api/interpreter";
const DEFAULT_NOMINATIM_ENDPOINT: &str = "https://nominatim.openstreetmap.org";
const DEFAULT_USER_AGENT: &str = concat!("moto-shop-sync/", env!("CARGO_PKG_VERSION"));

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub overpass_endpoint: String,
    pub nominatim_endpoint: String,
    pub http_user_agent: String,
    pub geocode_delay_ms: u64,
    pub record_delay_ms: u64,
    pub region_delay_ms: u64,
    pub chunk_delay_ms: u64,
    pub batch_chunk_size: usize,
    pub cron_max_shops_per_region: usize,
    pub database_file_name: String,
    pub cron_secret: Option<SecretString>,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub overpass_endpoint: String,
    pub nominatim_endpoint: String,
    pub http_user_agent: String,
    pub geocode_delay_ms: u64,
    pub record_delay_ms: u64,
    pub region_delay_ms: u64,
    pub chunk_delay_ms: u64,
    pub batch_chunk_size: usize,
    pub cron_max_shops_per_region: usize,
    pub database_file_name: String,
    pub has_cron_secret: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            overpass_endpoint: env::var("OVERPASS_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_OVERPASS_ENDPOINT.to_string()),
            nominatim_endpoint: env::var("NOMINATIM_ENDPOINT")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|_| DEFAULT_NOMINATIM_ENDPOINT.to_string()),
            http_user_agent: env::var("HTTP_USER_AGENT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            geocode_delay_ms: parse_u64("GEOCODE_DELAY_MS", 1_000),
            record_delay_ms: parse_u64("RECORD_DELAY_MS", 200),
            region_delay_ms: parse_u64("REGION_DELAY_MS", 2_000),
            chunk_delay_ms: parse_u64("CHUNK_DELAY_MS", 100),
            batch_chunk_size: parse_usize("BATCH_CHUNK_SIZE", 50).max(1),
            cron_max_shops_per_region: parse_usize("CRON_MAX_SHOPS_PER_REGION", 30).max(1),
            database_file_name: env::var("DATABASE_FILE_NAME")
                .unwrap_or_else(|_| "moto-shop-sync.db".to_string()),
            cron_secret: env::var("CRON_SECRET")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(SecretString::from),
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            overpass_endpoint: self.overpass_endpoint.clone(),
            nominatim_endpoint: self.nominatim_endpoint.clone(),
            http_user_agent: self.http_user_agent.clone(),
            geocode_delay_ms: self.geocode_delay_ms,
            record_delay_ms: self.record_delay_ms,
            region_delay_ms: self.region_delay_ms,
            chunk_delay_ms: self.chunk_delay_ms,
            batch_chunk_size: self.batch_chunk_size,
            cron_max_shops_per_region: self.cron_max_shops_per_region,
            database_file_name: self.database_file_name.clone(),
            has_cron_secret: self.cron_secret.is_some(),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            overpass_endpoint: DEFAULT_OVERPASS_ENDPOINT.to_string(),
            nominatim_endpoint: DEFAULT_NOMINATIM_ENDPOINT.to_string(),
            http_user_agent: DEFAULT_USER_AGENT.to_string(),
            geocode_delay_ms: 0,
            record_delay_ms: 0,
            region_delay_ms: 0,
            chunk_delay_ms: 0,
            batch_chunk_size: 50,
            cron_max_shops_per_region: 30,
            database_file_name: "test.db".to_string(),
            cron_secret: None,
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}
