//! HTTP dispatcher (SPEC_FULL.md §4.6): the collector's one request/response
//! surface. Mirrors the source's `ServeHTTP`/`handleUpdate`/
//! `checkRequiredKeys`.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::broker::BrokerSession;
use crate::bundle;
use crate::error::CollectorError;
use crate::scanner::ScanLimits;
use crate::stats::{Event, StatsBus};

/// The literal `arg1` value that requests a ping rather than bundle
/// processing (SPEC_FULL.md §4.6/§6).
const PING_ARG1: &str = "xxx";
const COMMAND_UPDATE: &str = "update";

/// Shared state every handler needs: the broker session, the stats bus, and
/// the scanning/waiting knobs read out of [`crate::config::CollectorConfig`].
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<BrokerSession>,
    pub stats: StatsBus,
    pub scan_limits: ScanLimits,
    pub wait_timeout: Duration,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateForm {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    arg1: Option<String>,
    #[serde(default)]
    bundlesize: Option<String>,
}

pub async fn update(
    form: web::Form<UpdateForm>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, CollectorError> {
    state.stats.emit(Event::GotRequest);
    let result = dispatch(form.into_inner(), &state).await;
    if result.is_err() {
        state.stats.emit(Event::RequestError);
    }
    result
}

fn require(value: Option<String>, name: &'static str) -> Result<String, CollectorError> {
    value.ok_or(CollectorError::MissingField(name))
}

async fn dispatch(form: UpdateForm, state: &AppState) -> Result<HttpResponse, CollectorError> {
    let command = require(form.command, "command")?;
    if command != COMMAND_UPDATE {
        return Err(CollectorError::UnknownCommand(command));
    }

    let from = require(form.from, "from")?;
    let arg1 = require(form.arg1, "arg1")?;

    if arg1 == PING_ARG1 {
        tracing::debug!(%from, "ping");
        return Ok(HttpResponse::Ok().body("OK"));
    }

    let bundlesize = require(form.bundlesize, "bundlesize")?;
    let declared_size: usize = bundlesize
        .parse()
        .map_err(|_| CollectorError::BadBundleSize(bundlesize.clone()))?;

    tracing::info!(%from, declared_size, "processing bundle");

    let worker = state.broker.new_worker(declared_size).await?;
    bundle::process_bundle(
        worker,
        arg1.as_bytes(),
        declared_size,
        state.scan_limits,
        state.wait_timeout,
        &state.stats,
    )
    .await?;

    Ok(HttpResponse::Ok().body("OK"))
}

pub async fn stats(state: web::Data<AppState>) -> HttpResponse {
    let snapshot = state.stats.snapshot().await;
    HttpResponse::Ok().json(snapshot)
}
