//! Error taxonomy for the market-data pipeline.
//!
//! `throttled` is deliberately not a variant here: a throttled store write is
//! informational (see `store::*::add` returning `bool`), never an `Err`.

use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MarketDataError {
    #[error("invalid interval: {0}")]
    InvalidInterval(String),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),

    #[error("not connected: {0}")]
    NotConnected(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl MarketDataError {
    fn status(&self) -> StatusCode {
        match self {
            MarketDataError::NotFound(_) => StatusCode::NOT_FOUND,
            MarketDataError::NotConnected(_) => StatusCode::BAD_REQUEST,
            MarketDataError::InvalidInterval(_) => StatusCode::BAD_REQUEST,
            MarketDataError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            MarketDataError::UnknownProvider(_) => StatusCode::BAD_REQUEST,
            MarketDataError::UnknownSymbol(_) => StatusCode::BAD_REQUEST,
            // Historical-fetch failures propagate to REST as 400 + {error}, per spec §7.
            MarketDataError::TransportFailure(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// REST handlers return `Result<Json<T>, MarketDataError>`; this impl maps
/// every variant onto its HTTP status/body shape.
impl IntoResponse for MarketDataError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status();
        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, MarketDataError>;
