//! Axum JSON API over the record store and the analytics engine.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use covid_adapters::RecordSource;
use covid_analytics::AnalyticsEngine;
use covid_core::{
    parse_day, DailyRecord, DailyTop5, DateBounds, DepartmentResume, NationalDailyReport,
};
use covid_storage::{RecordStore, StorageError};
use covid_sync::{csv_source_from_config, open_store, IngestPipeline, PipelineError, ServiceConfig};
use serde::Serialize;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub const CRATE_NAME: &str = "covid-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub analytics: AnalyticsEngine,
    pub ingest: IngestPipeline,
}

impl AppState {
    pub fn new(store: Arc<dyn RecordStore>, source: Arc<dyn RecordSource>) -> Self {
        Self {
            analytics: AnalyticsEngine::new(store.clone()),
            ingest: IngestPipeline::new(source, store.clone()),
            store,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing, repeated or unparseable request parameter.
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) | Self::Pipeline(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
struct ImportResponse {
    result: &'static str,
}

/// Raw `key=value` pairs of the query string, keeping repeated keys.
struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    fn from_extractor(
        query: Result<Query<Vec<(String, String)>>, QueryRejection>,
    ) -> Result<Self, ApiError> {
        let Query(pairs) = query.map_err(|e| ApiError::Validation(e.body_text()))?;
        Ok(Self(pairs))
    }

    fn all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .collect()
    }

    /// The parameter must be present exactly once.
    fn single(&self, name: &str) -> Result<&str, ApiError> {
        match self.all(name).as_slice() {
            [value] => Ok(*value),
            _ => Err(ApiError::Validation(format!(
                "query param {name} is mandatory"
            ))),
        }
    }

    fn day(&self, name: &str) -> Result<NaiveDate, ApiError> {
        let raw = self.single(name)?;
        parse_day(raw).map_err(|e| ApiError::Validation(format!("{name} must be a date: {e}")))
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/import", get(import_handler).post(import_handler))
        .route("/departments", get(departments_handler))
        .route("/age_categories", get(age_categories_handler))
        .route("/days", get(days_handler))
        .route("/data", get(data_handler))
        .route("/national", get(national_handler))
        .route("/department", get(department_resume_handler))
        .route("/daily_top5", get(daily_top5_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

pub async fn serve(config: &ServiceConfig) -> anyhow::Result<()> {
    let store = open_store(config).await?;
    store.migrate().await.context("migrating record store")?;
    let source = csv_source_from_config(config)?;
    let state = AppState::new(store, Arc::new(source));

    let listener = TcpListener::bind((config.host.as_str(), config.http_port))
        .await
        .with_context(|| format!("binding {}:{}", config.host, config.http_port))?;
    info!(addr = %listener.local_addr()?, "serving covid analytics api");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn import_handler(State(state): State<Arc<AppState>>) -> Result<Json<ImportResponse>, ApiError> {
    state.ingest.run_once().await?;
    Ok(Json(ImportResponse { result: "OK" }))
}

async fn departments_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<String>>, ApiError> {
    Ok(Json(state.store.list_departments().await?))
}

async fn age_categories_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<i32>>, ApiError> {
    Ok(Json(state.store.list_age_categories().await?))
}

async fn days_handler(State(state): State<Arc<AppState>>) -> Result<Json<DateBounds>, ApiError> {
    Ok(Json(state.store.date_range().await?))
}

async fn data_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<Json<Vec<DailyRecord>>, ApiError> {
    let params = QueryParams::from_extractor(query)?;
    let from = params.day("from")?;
    let to = params.day("to")?;
    let departments = params
        .all("departments")
        .into_iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    if departments.is_empty() {
        return Err(ApiError::Validation(
            "query param departments is mandatory".into(),
        ));
    }

    Ok(Json(state.store.query_records(from, to, &departments).await?))
}

async fn national_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<Json<Vec<NationalDailyReport>>, ApiError> {
    let params = QueryParams::from_extractor(query)?;
    let from = params.day("from")?;
    let to = params.day("to")?;
    Ok(Json(state.analytics.national_reports(from, to).await?))
}

async fn department_resume_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<Json<DepartmentResume>, ApiError> {
    let params = QueryParams::from_extractor(query)?;
    let department = params.single("department")?;
    Ok(Json(state.analytics.department_resume(department).await?))
}

async fn daily_top5_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<Vec<(String, String)>>, QueryRejection>,
) -> Result<Json<DailyTop5>, ApiError> {
    let params = QueryParams::from_extractor(query)?;
    let day = params.day("day")?;
    Ok(Json(state.analytics.daily_top5(day).await?))
}
