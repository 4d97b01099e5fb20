use chrono::{Timelike, Utc};
use secrecy::ExposeSecret;
use serde::Serialize;
use tracing::info;

use crate::agent::RunReport;
use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::reconcile::{ImportMode, RefreshOutcome, RegionOutcome};
use crate::AppState;

pub const DEFAULT_REFRESH_DAYS: i64 = 30;

/// Request shape accepted by the multi-region agent trigger.
#[derive(Debug, Clone)]
pub enum AgentRequest {
    Import {
        country_codes: Vec<String>,
        update_existing: bool,
        max_shops_per_country: Option<usize>,
    },
    Refresh {
        days_old: i64,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum AgentResponse {
    Import(RunReport),
    Refresh(RefreshOutcome),
}

/// Scheduled batch entry point. The shared-secret check is the only
/// authorization this crate performs; everything past it returns a structured
/// report even when every region failed.
pub async fn scheduled_batch(state: &AppState, provided_secret: Option<&str>) -> AppResult<RunReport> {
    authorize(state.config(), provided_secret)?;
    let utc_hour = Utc::now().hour();
    Ok(state.orchestrator().run_window(utc_hour).await)
}

/// On-demand single-region import.
pub async fn import_region(
    state: &AppState,
    country_code: Option<&str>,
    update_existing: bool,
) -> AppResult<RegionOutcome> {
    let region = country_code
        .map(str::trim)
        .filter(|code| !code.is_empty())
        .ok_or_else(|| AppError::Config("country code is required".into()))?;

    info!(region, update_existing, "starting single-region import");
    let mode = ImportMode {
        update_existing,
        max_records: None,
    };
    Ok(state.engine().process_region(region, &mode).await)
}

/// Multi-region/mode trigger: per-region reconcile or a staleness sweep.
pub async fn run_agent(state: &AppState, request: AgentRequest) -> AppResult<AgentResponse> {
    match request {
        AgentRequest::Import {
            country_codes,
            update_existing,
            max_shops_per_country,
        } => {
            if country_codes.is_empty() {
                return Err(AppError::Config("at least one country code is required".into()));
            }
            let mode = ImportMode {
                update_existing,
                max_records: max_shops_per_country,
            };
            let report = state.orchestrator().run_regions(&country_codes, &mode).await;
            Ok(AgentResponse::Import(report))
        }
        AgentRequest::Refresh { days_old } => {
            let outcome = state.engine().refresh_stale(days_old).await;
            Ok(AgentResponse::Refresh(outcome))
        }
    }
}

fn authorize(config: &AppConfig, provided: Option<&str>) -> AppResult<()> {
    let secret = config
        .cron_secret
        .as_ref()
        .ok_or_else(|| AppError::Config("CRON_SECRET is not configured".into()))?;
    match provided {
        Some(value) if value == secret.expose_secret() => Ok(()),
        _ => Err(AppError::Unauthorized),
    }
}
