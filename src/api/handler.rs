use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use tracing::{info, warn};

use super::models::*;
use crate::{
    error::{AppError, AppResult},
    ledger::{
        models::{normalize_address, DeadLetterRecord, RecordFilter, SyncStats},
        store::summarize_pending,
        LedgerStore,
    },
    middleware::validate_request,
    settlement::{accounts::AccountSync, driver::SettlementSummary, SettlementEngine},
};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub engine: Arc<SettlementEngine>,
    pub accounts: Arc<AccountSync>,
}

/// GET /health - liveness plus backlog size
pub async fn health_check(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let now = Utc::now();
    let filter = RecordFilter::eligible_at(now, state.engine.config().old_request_threshold);
    let eligible_records = state.ledger.count_eligible_records(&filter).await?;
    let inflight_settlements = state.ledger.list_inflight().await?.len();

    Ok(Json(HealthResponse {
        status: if inflight_settlements == 0 {
            "healthy".to_string()
        } else {
            "settling".to_string()
        },
        timestamp: now,
        eligible_records,
        inflight_settlements,
    }))
}

/// POST /settle - force settlement of every eligible record
pub async fn force_settle(
    State(state): State<AppState>,
) -> AppResult<(StatusCode, Json<SettlementSummary>)> {
    if state.engine.is_shutting_down() {
        return Err(AppError::ShuttingDown);
    }
    info!("🔄 Settlement requested over HTTP");
    // Own task: a dropped connection must not cancel a round mid-chunk
    let engine = state.engine.clone();
    let summary = tokio::spawn(async move { engine.force_settle().await })
        .await
        .map_err(|e| AppError::Internal(format!("settlement task failed: {}", e)))??;
    Ok((StatusCode::ACCEPTED, Json(summary)))
}

/// GET /settlement/pending - per-user pending totals
pub async fn get_pending(State(state): State<AppState>) -> AppResult<Json<PendingResponse>> {
    let records = state.ledger.list_unprocessed_records().await?;
    let users = summarize_pending(&records, Utc::now());

    Ok(Json(PendingResponse {
        total_records: records.len(),
        users,
    }))
}

/// GET /settlement/dead-letters - records purged by permanent failures
pub async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> AppResult<Json<Vec<DeadLetterRecord>>> {
    let user = match query.user.as_deref() {
        Some(raw) => Some(normalize_address(raw).ok_or_else(|| AppError::InvalidAddress(raw.to_string()))?),
        None => None,
    };
    Ok(Json(state.ledger.list_dead_letters(user.as_deref()).await?))
}

/// POST /records - ingest one metered request
pub async fn ingest_record(
    State(state): State<AppState>,
    Json(request): Json<IngestRecordRequest>,
) -> AppResult<(StatusCode, Json<IngestRecordResponse>)> {
    validate_request(&request)?;
    let user = normalize_address(&request.user_address)
        .ok_or_else(|| AppError::InvalidAddress(request.user_address.clone()))?;

    let now = Utc::now();
    let record = request.into_record(user.clone(), now);
    if let Err(e) = state.ledger.insert_record(&record).await {
        warn!("⚠️  Rejected usage record {}: {}", record.request_hash, e);
        return Err(e);
    }
    // unsettled aggregate changed
    state.accounts.cache().invalidate(&user).await;

    Ok((
        StatusCode::CREATED,
        Json(IngestRecordResponse {
            request_hash: record.request_hash,
            user_address: user,
            accepted_at: now,
        }),
    ))
}

/// GET /accounts/:user - cached account view
pub async fn get_account(
    State(state): State<AppState>,
    Path(user): Path<String>,
) -> AppResult<Json<AccountResponse>> {
    let account = state.accounts.get_or_create_account(&user).await?;
    Ok(Json(AccountResponse::from(account)))
}

/// POST /accounts/sync - mirror every on-chain account now
pub async fn sync_accounts(State(state): State<AppState>) -> AppResult<Json<SyncStats>> {
    Ok(Json(state.accounts.sync_all().await?))
}
