use std::{net::SocketAddr, sync::Arc};

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, StatusCode, header},
    routing::{get, post},
};
use chrono::Utc;
use dealmint_attribution::{AttributionService, TokenSigner};
use dealmint_core::{Conversion, LedgerError, PayoutRequest, PayoutState};
use dealmint_finance::{
    AffiliateSummary, BalanceLedger, CommissionCalculator, ConversionIntake, ConversionOutcome,
    MaturationScheduler, SummaryReader,
};
use dealmint_payouts::{PayoutInput, PayoutService, RecordedTransfer};
use dealmint_platform::{
    AdjustmentRequest, AdjustmentResponse, ApprovePayoutRequest, CONVERSIONS_CHANNEL,
    ConversionEvent, ErrorBody, LedgerResponse, PAYOUTS_CHANNEL, PayoutEvent, PayoutQueueQuery,
    PgStore, RecordClickRequest, RecordClickResponse, RecordConversionRequest,
    RecordConversionResponse, RedisBus, RejectPayoutRequest, ReverseConversionRequest,
    ServiceConfig, connect_database, ensure_schema,
};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

const ATTRIBUTION_COOKIE: &str = "dm_attr";
const MAX_QUEUE_PAGE: usize = 500;
const SWEEP_BATCH_SIZE: usize = 200;

type ApiError = (StatusCode, Json<ErrorBody>);

#[derive(Clone)]
struct AppState {
    redis: RedisBus,
    attribution: Arc<AttributionService>,
    calculator: Arc<CommissionCalculator>,
    ledger: Arc<BalanceLedger>,
    scheduler: Arc<MaturationScheduler>,
    summaries: Arc<SummaryReader>,
    payouts: Arc<PayoutService>,
    cookie_max_age_secs: i64,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "dealmint_gateway=info,dealmint_finance=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8080")?;
    let pool = connect_database(&config.database_url).await?;
    ensure_schema(&pool).await?;
    let redis = RedisBus::connect(&config.redis_url)?;

    let store = Arc::new(PgStore::new(pool));
    let signer =
        TokenSigner::new(config.attribution_secret.as_bytes()).map_err(anyhow::Error::msg)?;
    let policy = config.policy.clone();

    let attribution = Arc::new(AttributionService::new(
        store.clone(),
        store.clone(),
        signer,
        policy.attribution_window,
    ));
    let ledger = Arc::new(BalanceLedger::new(store.clone()));
    let calculator = Arc::new(CommissionCalculator::new(
        attribution.clone(),
        store.clone(),
        ledger.clone(),
        policy.clone(),
    ));
    let scheduler = Arc::new(MaturationScheduler::new(
        store.clone(),
        ledger.clone(),
        SWEEP_BATCH_SIZE,
    ));
    let summaries = Arc::new(SummaryReader::new(
        scheduler.clone(),
        store.clone(),
        store.clone(),
    ));
    let payouts = Arc::new(PayoutService::new(
        store.clone(),
        store.clone(),
        ledger.clone(),
        scheduler.clone(),
        policy.clone(),
    ));

    let state = AppState {
        redis,
        attribution,
        calculator,
        ledger,
        scheduler,
        summaries,
        payouts,
        cookie_max_age_secs: policy.attribution_window.num_seconds(),
    };
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/links/{link_id}/clicks", post(record_click))
        .route("/conversions", post(record_conversion))
        .route("/conversions/{conversion_id}/reverse", post(reverse_conversion))
        .route("/affiliates/{affiliate_id}/balance", get(affiliate_balance))
        .route("/affiliates/{affiliate_id}/ledger", get(affiliate_ledger))
        .route(
            "/affiliates/{affiliate_id}/payouts",
            get(list_affiliate_payouts).post(request_payout),
        )
        .route("/admin/payouts", get(payout_queue))
        .route("/admin/payouts/{payout_id}/approve", post(approve_payout))
        .route("/admin/payouts/{payout_id}/reject", post(reject_payout))
        .route(
            "/admin/affiliates/{affiliate_id}/adjustments",
            post(adjust_balance),
        )
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn record_click(
    State(state): State<AppState>,
    Path(link_id): Path<Uuid>,
    Json(payload): Json<RecordClickRequest>,
) -> Result<(StatusCode, [(HeaderName, String); 1], Json<RecordClickResponse>), ApiError> {
    let issued = state
        .attribution
        .record_click(link_id, &payload.visitor_id, Utc::now())
        .await
        .map_err(ledger_error)?;

    let cookie = format!(
        "{ATTRIBUTION_COOKIE}={}; Max-Age={}; Path=/; HttpOnly; SameSite=Lax",
        issued.token, state.cookie_max_age_secs
    );
    Ok((
        StatusCode::CREATED,
        [(header::SET_COOKIE, cookie)],
        Json(RecordClickResponse {
            token: issued.token,
            click_id: issued.click.id,
            link_id,
            affiliate_id: issued.click.affiliate_id,
            expires_at: issued.expires_at,
        }),
    ))
}

async fn record_conversion(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RecordConversionRequest>,
) -> Result<(StatusCode, Json<RecordConversionResponse>), ApiError> {
    let token = payload
        .attribution_token
        .clone()
        .filter(|token| !token.trim().is_empty())
        .or_else(|| cookie_value(&headers, ATTRIBUTION_COOKIE));

    let outcome = state
        .calculator
        .record_conversion(
            token.as_deref(),
            ConversionIntake {
                idempotency_key: payload.idempotency_key,
                coupon_id: payload.coupon_id,
                order_value: payload.order_value,
                user_id: payload.user_id,
                visitor_id: payload.visitor_id,
            },
            Utc::now(),
        )
        .await
        .map_err(ledger_error)?;

    match outcome {
        ConversionOutcome::Attributed {
            conversion,
            replayed,
        } => {
            if !replayed {
                publish(
                    &state.redis,
                    CONVERSIONS_CHANNEL,
                    &ConversionEvent::recorded(&conversion),
                )
                .await;
            }
            let status = if replayed {
                StatusCode::OK
            } else {
                StatusCode::CREATED
            };
            Ok((
                status,
                Json(RecordConversionResponse {
                    attributed: true,
                    replayed,
                    conversion: Some(conversion),
                    unattributed_reason: None,
                }),
            ))
        }
        ConversionOutcome::Unattributed { record, replayed } => Ok((
            StatusCode::OK,
            Json(RecordConversionResponse {
                attributed: false,
                replayed,
                conversion: None,
                unattributed_reason: Some(record.reason_code),
            }),
        )),
    }
}

async fn reverse_conversion(
    State(state): State<AppState>,
    Path(conversion_id): Path<Uuid>,
    Json(payload): Json<ReverseConversionRequest>,
) -> Result<Json<Conversion>, ApiError> {
    let conversion = state
        .calculator
        .reverse_conversion(
            conversion_id,
            &payload.reason,
            &payload.reversed_by,
            Utc::now(),
        )
        .await
        .map_err(ledger_error)?;

    publish(
        &state.redis,
        CONVERSIONS_CHANNEL,
        &ConversionEvent::reversed(&conversion),
    )
    .await;
    Ok(Json(conversion))
}

async fn affiliate_balance(
    State(state): State<AppState>,
    Path(affiliate_id): Path<Uuid>,
) -> Result<Json<AffiliateSummary>, ApiError> {
    let summary = state
        .summaries
        .summary(affiliate_id, Utc::now())
        .await
        .map_err(ledger_error)?;
    Ok(Json(summary))
}

async fn affiliate_ledger(
    State(state): State<AppState>,
    Path(affiliate_id): Path<Uuid>,
) -> Result<Json<LedgerResponse>, ApiError> {
    let balance = state
        .scheduler
        .balance_at(affiliate_id, Utc::now())
        .await
        .map_err(ledger_error)?;
    let entries = state
        .ledger
        .entries(affiliate_id)
        .await
        .map_err(ledger_error)?;

    Ok(Json(LedgerResponse {
        affiliate_id,
        balance,
        entries,
    }))
}

async fn request_payout(
    State(state): State<AppState>,
    Path(affiliate_id): Path<Uuid>,
    Json(payload): Json<PayoutInput>,
) -> Result<(StatusCode, Json<PayoutRequest>), ApiError> {
    let now = Utc::now();
    let request = state
        .payouts
        .request(affiliate_id, payload, now)
        .await
        .map_err(ledger_error)?;

    publish(
        &state.redis,
        PAYOUTS_CHANNEL,
        &PayoutEvent::from_request(&request, now),
    )
    .await;
    Ok((StatusCode::CREATED, Json(request)))
}

async fn list_affiliate_payouts(
    State(state): State<AppState>,
    Path(affiliate_id): Path<Uuid>,
) -> Result<Json<Vec<PayoutRequest>>, ApiError> {
    let requests = state
        .payouts
        .list_for_affiliate(affiliate_id)
        .await
        .map_err(ledger_error)?;
    Ok(Json(requests))
}

async fn payout_queue(
    State(state): State<AppState>,
    Query(query): Query<PayoutQueueQuery>,
) -> Result<Json<Vec<PayoutRequest>>, ApiError> {
    let payout_state = match query.state.as_deref() {
        Some(raw) => raw.parse::<PayoutState>().map_err(ledger_error)?,
        None => PayoutState::Pending,
    };
    let requests = state
        .payouts
        .list_by_state(payout_state, query.limit.clamp(1, MAX_QUEUE_PAGE))
        .await
        .map_err(ledger_error)?;
    Ok(Json(requests))
}

async fn approve_payout(
    State(state): State<AppState>,
    Path(payout_id): Path<Uuid>,
    Json(payload): Json<ApprovePayoutRequest>,
) -> Result<Json<PayoutRequest>, ApiError> {
    let now = Utc::now();
    let processor = RecordedTransfer::new(payload.transaction_id);
    match state
        .payouts
        .approve(payout_id, &payload.approved_by, &processor, now)
        .await
    {
        Ok(completed) => {
            publish(
                &state.redis,
                PAYOUTS_CHANNEL,
                &PayoutEvent::from_request(&completed, now),
            )
            .await;
            Ok(Json(completed))
        }
        Err(err) => {
            if matches!(
                err,
                LedgerError::InsufficientBalance { .. } | LedgerError::PaymentFailed { .. }
            ) {
                if let Ok(rejected) = state.payouts.get(payout_id).await {
                    publish(
                        &state.redis,
                        PAYOUTS_CHANNEL,
                        &PayoutEvent::from_request(&rejected, now),
                    )
                    .await;
                }
            }
            Err(ledger_error(err))
        }
    }
}

async fn reject_payout(
    State(state): State<AppState>,
    Path(payout_id): Path<Uuid>,
    Json(payload): Json<RejectPayoutRequest>,
) -> Result<Json<PayoutRequest>, ApiError> {
    let now = Utc::now();
    let rejected = state
        .payouts
        .reject(payout_id, &payload.rejected_by, &payload.reason, now)
        .await
        .map_err(ledger_error)?;

    publish(
        &state.redis,
        PAYOUTS_CHANNEL,
        &PayoutEvent::from_request(&rejected, now),
    )
    .await;
    Ok(Json(rejected))
}

async fn adjust_balance(
    State(state): State<AppState>,
    Path(affiliate_id): Path<Uuid>,
    Json(payload): Json<AdjustmentRequest>,
) -> Result<(StatusCode, Json<AdjustmentResponse>), ApiError> {
    let reference = payload
        .reference
        .filter(|reference| !reference.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let applied = state
        .ledger
        .adjust(
            affiliate_id,
            &reference,
            payload.bucket,
            payload.amount,
            &payload.actor,
            &payload.memo,
            Utc::now(),
        )
        .await
        .map_err(ledger_error)?;

    let status = if applied.fresh {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(AdjustmentResponse {
            entry: applied.entry,
            balance: applied.balance,
            replayed: !applied.fresh,
        }),
    ))
}

async fn publish<T: Serialize>(redis: &RedisBus, channel: &str, payload: &T) {
    if let Err(err) = redis.publish_json(channel, payload).await {
        error!("failed to publish to {channel}: {err}");
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, value)| *key == name && !value.is_empty())
        .map(|(_, value)| value.to_string())
}

fn status_for(err: &LedgerError) -> StatusCode {
    match err {
        LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
        LedgerError::InsufficientBalance { .. }
        | LedgerError::InvalidTransition { .. }
        | LedgerError::AlreadyReversed(_) => StatusCode::CONFLICT,
        LedgerError::MinimumPayoutNotMet { .. }
        | LedgerError::InvalidAmount(_)
        | LedgerError::InvalidRequest(_) => StatusCode::UNPROCESSABLE_ENTITY,
        LedgerError::AffiliateInactive(_) => StatusCode::FORBIDDEN,
        LedgerError::PaymentFailed { .. } => StatusCode::BAD_GATEWAY,
        LedgerError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn ledger_error(err: LedgerError) -> ApiError {
    let status = status_for(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("request failed: {err}");
    }
    (
        status,
        Json(ErrorBody {
            code: err.code().to_string(),
            message: err.to_string(),
        }),
    )
}
