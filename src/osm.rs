use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};

const OVERPASS_TIMEOUT_SECS: u64 = 60;
const NOMINATIM_TIMEOUT_SECS: u64 = 10;

/// One element returned by the Overpass query. Ways and relations carry a
/// derived centroid instead of direct coordinates.
#[derive(Debug, Clone, Deserialize)]
pub struct RawElement {
    #[serde(rename = "type")]
    pub kind: ElementKind,
    pub id: i64,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub center: Option<Centroid>,
    #[serde(default)]
    pub tags: ShopTags,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Centroid {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementKind {
    Node,
    Way,
    Relation,
}

impl ElementKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementKind::Node => "node",
            ElementKind::Way => "way",
            ElementKind::Relation => "relation",
        }
    }
}

/// The recognized subset of OSM tags, plus a sink for everything else so
/// unexpected keys survive for audit logging instead of being dropped.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShopTags {
    pub name: Option<String>,
    #[serde(rename = "addr:street")]
    pub street: Option<String>,
    #[serde(rename = "addr:housenumber")]
    pub house_number: Option<String>,
    #[serde(rename = "addr:postcode")]
    pub postcode: Option<String>,
    #[serde(rename = "addr:city")]
    pub city: Option<String>,
    #[serde(rename = "addr:country")]
    pub country: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub opening_hours: Option<String>,
    #[serde(rename = "contact:phone")]
    pub contact_phone: Option<String>,
    #[serde(rename = "contact:email")]
    pub contact_email: Option<String>,
    #[serde(rename = "contact:website")]
    pub contact_website: Option<String>,
    #[serde(rename = "service:repair")]
    pub service_repair: Option<String>,
    #[serde(rename = "service:vehicle:tyres")]
    pub service_tyres: Option<String>,
    #[serde(rename = "service:vehicle:oil_change")]
    pub service_oil_change: Option<String>,
    #[serde(rename = "service:vehicle:parts")]
    pub service_parts: Option<String>,
    #[serde(rename = "service:vehicle:inspection")]
    pub service_inspection: Option<String>,
    #[serde(rename = "service:vehicle:maintenance")]
    pub service_maintenance: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

impl RawElement {
    /// Provider kind+id concatenation, the reconciliation key across runs.
    pub fn external_id(&self) -> String {
        format!("{}{}", self.kind.as_str(), self.id)
    }

    pub fn coordinate(&self) -> Option<(f64, f64)> {
        match (self.lat, self.lon) {
            (Some(lat), Some(lon)) => Some((lat, lon)),
            _ => self.center.map(|c| (c.lat, c.lon)),
        }
    }
}

/// Reverse-geocoded address pieces from Nominatim.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GeocodedAddress {
    pub road: Option<String>,
    pub house_number: Option<String>,
    pub postcode: Option<String>,
    pub city: Option<String>,
    pub town: Option<String>,
    pub village: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
}

impl GeocodedAddress {
    pub fn resolved_city(&self) -> Option<&str> {
        self.city
            .as_deref()
            .or(self.town.as_deref())
            .or(self.village.as_deref())
    }
}

#[async_trait]
pub trait SourceFetch: Send + Sync {
    async fn fetch_region(&self, region_code: &str) -> AppResult<Vec<RawElement>>;
}

#[async_trait]
pub trait ReverseGeocode: Send + Sync {
    /// Best-effort lookup: any non-success response or malformed payload is
    /// "no data", never an error.
    async fn reverse(&self, lat: f64, lon: f64) -> Option<GeocodedAddress>;
}

pub struct OverpassClient {
    http: Client,
    endpoint: String,
}

impl OverpassClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let http = Client::builder()
            .user_agent(config.http_user_agent.clone())
            .timeout(Duration::from_secs(OVERPASS_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.overpass_endpoint.clone(),
        })
    }

    fn region_query(region_code: &str) -> String {
        format!(
            r#"[out:json][timeout:60];
area["ISO3166-1"="{region_code}"]["admin_level"="2"]->.country;
(
  node["shop"="motorcycle"]["service:repair"="yes"](area.country);
  node["shop"="motorcycle_repair"](area.country);
  node["craft"="motorcycle_repair"](area.country);
  way["shop"="motorcycle"]["service:repair"="yes"](area.country);
  way["shop"="motorcycle_repair"](area.country);
  way["craft"="motorcycle_repair"](area.country);
);
out center;"#
        )
    }
}

#[derive(Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<RawElement>,
}

#[async_trait]
impl SourceFetch for OverpassClient {
    async fn fetch_region(&self, region_code: &str) -> AppResult<Vec<RawElement>> {
        let query = Self::region_query(region_code);
        let response = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(query)
            .send()
            .await
            .map_err(|err| AppError::SourceUnavailable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::SourceUnavailable(format!(
                "overpass returned status {}",
                response.status()
            )));
        }

        let parsed: OverpassResponse = response
            .json()
            .await
            .map_err(|err| AppError::SourceUnavailable(err.to_string()))?;
        debug!(
            region = region_code,
            elements = parsed.elements.len(),
            "fetched overpass elements"
        );
        Ok(parsed.elements)
    }
}

pub struct NominatimClient {
    http: Client,
    endpoint: String,
}

impl NominatimClient {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        // Nominatim's usage policy requires a descriptive client identifier.
        let http = Client::builder()
            .user_agent(config.http_user_agent.clone())
            .timeout(Duration::from_secs(NOMINATIM_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            endpoint: config.nominatim_endpoint.clone(),
        })
    }
}

#[derive(Deserialize)]
struct NominatimResponse {
    address: Option<GeocodedAddress>,
}

#[async_trait]
impl ReverseGeocode for NominatimClient {
    async fn reverse(&self, lat: f64, lon: f64) -> Option<GeocodedAddress> {
        let url = format!(
            "{}/reverse?format=json&lat={lat}&lon={lon}&addressdetails=1",
            self.endpoint
        );
        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(?err, lat, lon, "nominatim request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(status = %response.status(), lat, lon, "nominatim returned non-success");
            return None;
        }
        match response.json::<NominatimResponse>().await {
            Ok(parsed) => parsed.address,
            Err(err) => {
                warn!(?err, lat, lon, "nominatim payload was malformed");
                None
            }
        }
    }
}

/// Enforces a minimum spacing between consecutive external calls. The wait
/// happens at the start of each call, so a failed or slow predecessor never
/// lets the loop burst subsequent calls.
pub struct Pacer {
    min_interval_ms: AtomicU64,
    last_tick: AsyncMutex<Option<Instant>>,
}

impl Pacer {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval_ms: AtomicU64::new(min_interval_ms),
            last_tick: AsyncMutex::new(None),
        }
    }

    pub fn set_interval_ms(&self, min_interval_ms: u64) {
        self.min_interval_ms
            .store(min_interval_ms, Ordering::SeqCst);
    }

    pub fn interval_ms(&self) -> u64 {
        self.min_interval_ms.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        let interval = Duration::from_millis(self.interval_ms());
        let mut guard = self.last_tick.lock().await;
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        *guard = Some(Instant::now());
    }
}
