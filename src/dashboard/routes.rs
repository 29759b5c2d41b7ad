//! Dashboard API route handlers.
//!
//! All endpoints return JSON. State is shared via `Arc<DashboardState>`.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::keeper::{ParkedPayouts, RetriedPayout};
use crate::lottery::Lottery;
use crate::types::{EntryReceipt, LotteryError, LotteryEvent, PlayerId, RoundState, UpkeepStatus};

/// Entries kept in each history log.
const HISTORY_LIMIT: usize = 100;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// Shared state accessible by all route handlers.
pub struct DashboardState {
    pub name: String,
    pub lottery: Arc<Lottery>,
    pub payouts: ParkedPayouts,
    pub winners: RwLock<Vec<WinnerLogEntry>>,
    pub entries: RwLock<Vec<EntryLogEntry>>,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl DashboardState {
    pub fn new(name: impl Into<String>, lottery: Arc<Lottery>, payouts: ParkedPayouts) -> Self {
        Self {
            name: name.into(),
            lottery,
            payouts,
            winners: RwLock::new(Vec::new()),
            entries: RwLock::new(Vec::new()),
            started_at: chrono::Utc::now(),
        }
    }

    /// Fold one lottery event into the history logs.
    pub async fn record(&self, event: &LotteryEvent) {
        let timestamp = chrono::Utc::now().to_rfc3339();
        match event {
            LotteryEvent::EnteredRound { player, amount } => {
                push_capped(
                    &mut *self.entries.write().await,
                    EntryLogEntry {
                        timestamp,
                        player: player.clone(),
                        amount: *amount,
                    },
                );
            }
            LotteryEvent::WinnerPicked { winner, amount, request_id } => {
                push_capped(
                    &mut *self.winners.write().await,
                    WinnerLogEntry {
                        timestamp,
                        winner: winner.clone(),
                        amount: *amount,
                        request_id: request_id.0,
                    },
                );
            }
            LotteryEvent::UpkeepTriggered { .. } => {}
        }
    }
}

fn push_capped<T>(log: &mut Vec<T>, item: T) {
    log.push(item);
    if log.len() > HISTORY_LIMIT {
        let excess = log.len() - HISTORY_LIMIT;
        log.drain(..excess);
    }
}

// ---------------------------------------------------------------------------
// Request / response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub name: String,
    pub state: RoundState,
    pub players: usize,
    pub balance: Decimal,
    pub entrance_fee: Decimal,
    pub interval_secs: i64,
    pub last_trigger_time: String,
    pub pending_request: Option<u64>,
    pub parked_payouts: Vec<u64>,
    pub recent_winner: Option<PlayerId>,
    pub rounds_completed: u64,
    pub uptime_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpkeepResponse {
    pub upkeep_needed: bool,
    #[serde(flatten)]
    pub status: UpkeepStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct WinnerLogEntry {
    pub timestamp: String,
    pub winner: PlayerId,
    pub amount: Decimal,
    pub request_id: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryLogEntry {
    pub timestamp: String,
    pub player: PlayerId,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnterRequest {
    pub player: String,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
}

/// A `LotteryError` rendered as an HTTP response.
pub struct ApiError(pub LotteryError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            LotteryError::InsufficientFee { .. } => (StatusCode::BAD_REQUEST, "insufficient_fee"),
            LotteryError::RoundNotOpen { .. } => (StatusCode::CONFLICT, "round_not_open"),
            LotteryError::BalanceOverflow { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "balance_overflow"),
            LotteryError::NoParkedPayout => (StatusCode::NOT_FOUND, "no_parked_payout"),
            LotteryError::TransferFailure { .. } => (StatusCode::BAD_GATEWAY, "transfer_failure"),
            LotteryError::Ledger(_) => (StatusCode::BAD_GATEWAY, "ledger"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        let body = ErrorBody {
            error: kind.to_string(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

pub type AppState = Arc<DashboardState>;

/// GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let round = state.lottery.snapshot().await;
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds();
    let parked = state.payouts.request_ids().await;

    Json(StatusResponse {
        name: state.name.clone(),
        state: round.state,
        players: round.entrants.len(),
        balance: round.balance,
        entrance_fee: state.lottery.entrance_fee(),
        interval_secs: state.lottery.interval().num_seconds(),
        last_trigger_time: round.last_trigger_time.to_rfc3339(),
        pending_request: round.pending.as_ref().map(|p| p.request_id.0),
        parked_payouts: parked.into_iter().map(|id| id.0).collect(),
        recent_winner: round.recent_winner,
        rounds_completed: round.rounds_completed,
        uptime_secs: uptime,
    })
}

/// GET /api/upkeep
pub async fn get_upkeep(State(state): State<AppState>) -> Json<UpkeepResponse> {
    let status = state.lottery.check_upkeep().await;
    Json(UpkeepResponse {
        upkeep_needed: status.upkeep_needed(),
        status,
    })
}

/// GET /api/players
pub async fn get_players(State(state): State<AppState>) -> Json<Vec<PlayerId>> {
    Json(state.lottery.snapshot().await.entrants)
}

/// GET /api/winners
pub async fn get_winners(State(state): State<AppState>) -> Json<Vec<WinnerLogEntry>> {
    Json(state.winners.read().await.clone())
}

/// GET /api/entries
pub async fn get_entries(State(state): State<AppState>) -> Json<Vec<EntryLogEntry>> {
    Json(state.entries.read().await.clone())
}

/// POST /api/enter
pub async fn post_enter(
    State(state): State<AppState>,
    Json(req): Json<EnterRequest>,
) -> Result<Json<EntryReceipt>, ApiError> {
    let receipt = state
        .lottery
        .enter_round(PlayerId::new(req.player), req.amount)
        .await
        .map_err(ApiError)?;
    Ok(Json(receipt))
}

/// POST /api/payout/retry
pub async fn post_retry_payout(State(state): State<AppState>) -> Result<Json<RetriedPayout>, ApiError> {
    state
        .payouts
        .retry(&state.lottery)
        .await
        .map(Json)
        .map_err(ApiError)
}

/// GET /health
pub async fn health() -> StatusCode {
    StatusCode::OK
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
