use std::io;

use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Config(String),
    #[error("caller is not authorized")]
    Unauthorized,
    #[error("source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("record {0} has no usable coordinates")]
    MissingCoordinate(String),
}
