//! Connection status, sync trigger and issue listing endpoints.

use super::{public_message, status_for, AppError, AppState};
use crate::credentials::IntegrationRecord;
use crate::issues::{IssueFilter, IssueRecord};
use crate::sync::SyncStage;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;


/// Response for GET /api/connectors/:provider/status
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub connected: bool,
    pub reauth_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scopes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync_at: Option<String>,
}

impl StatusResponse {
    pub fn disconnected() -> Self {
        Self {
            connected: false,
            reauth_required: false,
            site_name: None,
            site_url: None,
            cloud_id: None,
            scopes: None,
            expires_at: None,
            last_sync_at: None,
        }
    }
}

impl From<IntegrationRecord> for StatusResponse {
    fn from(record: IntegrationRecord) -> Self {
        Self {
            connected: true,
            reauth_required: record.reauth_required,
            site_name: Some(record.site_name),
            site_url: Some(record.site_url),
            cloud_id: Some(record.cloud_id),
            scopes: Some(record.scopes.into_iter().collect()),
            expires_at: Some(record.expires_at.to_rfc3339()),
            last_sync_at: record.last_sync_at.map(|t| t.to_rfc3339()),
        }
    }
}

/// Response for POST /api/connectors/:provider/sync
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub ok: bool,
    pub synced_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<SyncStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reauth_required: bool,
}

/// Response for GET /api/connectors/:provider/issues
#[derive(Serialize, Debug)]
pub struct IssuesResponse {
    pub ok: bool,
    pub issues: Vec<IssueRecord>,
}

/// GET /api/connectors/:provider/status
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Json<StatusResponse>, AppError> {
    state.flow(&provider)?;

    let response = state
        .credentials
        .get(&state.user_id, &provider)
        .map_err(crate::error::Error::from)?
        .map(StatusResponse::from)
        .unwrap_or_else(StatusResponse::disconnected);

    debug!(provider = %provider, connected = response.connected, "Status requested");
    Ok(Json(response))
}

/// POST /api/connectors/:provider/sync
///
/// Runs a sync to completion. Failures still report how many issues were
/// written before the stop.
pub async fn sync(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Response, AppError> {
    state.flow(&provider)?;

    let response = match state.sync.sync_now(&state.user_id, &provider).await {
        Ok(report) => (
            StatusCode::OK,
            Json(SyncResponse {
                ok: true,
                synced_count: report.synced,
                skipped_count: Some(report.skipped),
                failed_at: None,
                error: None,
                reauth_required: false,
            }),
        )
            .into_response(),
        Err(failure) => (
            status_for(&failure.error),
            Json(SyncResponse {
                ok: false,
                synced_count: failure.synced,
                skipped_count: None,
                failed_at: Some(failure.stage),
                error: Some(public_message(&failure.error)),
                reauth_required: failure.error.requires_reauth(),
            }),
        )
            .into_response(),
    };

    Ok(response)
}

/// GET /api/connectors/:provider/issues?search&priority&assignee&limit
///
/// Served from the local cache only.
pub async fn issues(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(filter): Query<IssueFilter>,
) -> Result<Json<IssuesResponse>, AppError> {
    state.flow(&provider)?;

    let issues = state
        .read_model
        .list_issues(&state.user_id, &provider, &filter)?;

    Ok(Json(IssuesResponse { ok: true, issues }))
}
