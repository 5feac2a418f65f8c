//! Top-level error type (SPEC_FULL.md §7): aggregates every module's error
//! enum and maps each variant to the HTTP status the dispatcher returns.

use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};

use crate::broker::BrokerError;
use crate::bundle::BundleError;

#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("no {0}")]
    MissingField(&'static str),
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
    #[error("invalid bundlesize {0:?}")]
    BadBundleSize(String),
    #[error("error acquiring broker worker: {0}")]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Bundle(#[from] BundleError),
}

impl ResponseError for CollectorError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingField(_) | Self::UnknownCommand(_) | Self::BadBundleSize(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Broker(_) | Self::Bundle(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        tracing::warn!(error = %self, status = %self.status_code(), "request failed");
        HttpResponse::build(self.status_code()).body(format!("Error: {self}"))
    }
}
