use crate::error::EscrowError;
use crate::models::{AuditRecord, Order, Transaction};
use crate::orders::CreateOrder;
use crate::reconciliation::{
    CollectionReceipt, ReconciliationEngine, Resolution, SettlementReceipt,
};
use crate::state_machine::{OrderEvent, OrderStatus};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use bigdecimal::BigDecimal;
use payment_providers::Acknowledgement;
use serde::{Deserialize, Serialize};
use shared::{CallbackKind, PaymentMethod, TransactionKind};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub buyer_id: Uuid,
    pub seller_id: Uuid,
    pub item_description: String,
    pub amount: BigDecimal,
    #[serde(default)]
    pub currency: Option<String>,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub payer_phone: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub order: Order,
    pub transaction: Transaction,
    pub redirect_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActorRequest {
    pub actor_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct CollectRequest {
    pub actor_id: Uuid,
    #[serde(default)]
    pub payer_phone: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeliverRequest {
    pub actor_id: Uuid,
    pub proof_of_delivery: String,
}

#[derive(Debug, Deserialize)]
pub struct DisputeRequest {
    pub actor_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub actor_id: Uuid,
    pub target: OrderStatus,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Set when the order was created but paying for it failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);
type ApiResult<T> = Result<Json<T>, ApiError>;

fn status_for(error: &EscrowError) -> StatusCode {
    match error {
        EscrowError::InvalidInput(_) | EscrowError::SellerNotEligible(_) => StatusCode::BAD_REQUEST,
        EscrowError::NotAuthorized(_) => StatusCode::FORBIDDEN,
        EscrowError::NotFound { .. } => StatusCode::NOT_FOUND,
        EscrowError::InvalidTransition { .. }
        | EscrowError::Inconsistent { .. }
        | EscrowError::DuplicateCorrelationRef { .. } => StatusCode::CONFLICT,
        EscrowError::Provider(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn api_error(error: EscrowError) -> ApiError {
    let status = status_for(&error);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("request failed: {}", error);
    }
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            order_id: None,
        }),
    )
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/orders", post(checkout))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/transactions", get(order_transactions))
        .route("/orders/:id/history", get(order_history))
        .route("/orders/:id/collect", post(collect))
        .route("/orders/:id/ship", post(ship))
        .route("/orders/:id/deliver", post(deliver))
        .route("/orders/:id/confirm", post(confirm))
        .route("/orders/:id/dispute", post(dispute))
        .route("/orders/:id/cancel", post(cancel))
        .route("/admin/orders/:id/release", post(release))
        .route("/admin/orders/:id/refund", post(refund))
        .route("/admin/orders/:id/override", post(override_status))
        .route("/webhooks/:provider/:purpose/:kind", post(webhook))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
}

pub async fn checkout(
    State(state): State<AppState>,
    Json(request): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), ApiError> {
    let order_request = CreateOrder {
        buyer_id: request.buyer_id,
        seller_id: request.seller_id,
        item_description: request.item_description,
        amount: request.amount,
        currency: request.currency,
        payment_method: request.payment_method,
    };

    let checkout = state
        .engine
        .checkout(order_request, request.payer_phone)
        .await
        .map_err(api_error)?;

    match checkout.collection {
        Ok(CollectionReceipt {
            transaction,
            redirect_url,
        }) => Ok((
            StatusCode::CREATED,
            Json(CheckoutResponse {
                order: checkout.order,
                transaction,
                redirect_url,
            }),
        )),
        Err(e) => {
            let (status, Json(mut body)) = api_error(e);
            body.order_id = Some(checkout.order.id);
            Err((status, Json(body)))
        }
    }
}

pub async fn get_order(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Order> {
    state.engine.orders().get(id).await.map(Json).map_err(api_error)
}

pub async fn order_transactions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<Transaction>> {
    state.engine.transactions(id).await.map(Json).map_err(api_error)
}

pub async fn order_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<AuditRecord>> {
    state.engine.orders().history(id).await.map(Json).map_err(api_error)
}

pub async fn collect(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<CollectRequest>,
) -> ApiResult<CollectionReceipt> {
    state
        .engine
        .request_collection(id, request.actor_id, request.payer_phone)
        .await
        .map(Json)
        .map_err(api_error)
}

async fn transition(state: &AppState, id: Uuid, event: OrderEvent, actor_id: Uuid) -> ApiResult<Order> {
    state
        .engine
        .orders()
        .transition(id, event, actor_id)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn ship(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<Order> {
    transition(&state, id, OrderEvent::Ship, request.actor_id).await
}

pub async fn deliver(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<DeliverRequest>,
) -> ApiResult<Order> {
    let event = OrderEvent::ReportDelivered {
        proof_of_delivery: request.proof_of_delivery,
    };
    transition(&state, id, event, request.actor_id).await
}

pub async fn dispute(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<DisputeRequest>,
) -> ApiResult<Order> {
    let event = OrderEvent::RaiseDispute {
        reason: request.reason,
    };
    transition(&state, id, event, request.actor_id).await
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<Order> {
    transition(&state, id, OrderEvent::Cancel, request.actor_id).await
}

pub async fn override_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<OverrideRequest>,
) -> ApiResult<Order> {
    let event = OrderEvent::AdminOverride {
        target: request.target,
        reason: request.reason,
    };
    transition(&state, id, event, request.actor_id).await
}

pub async fn confirm(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<SettlementReceipt> {
    state
        .engine
        .confirm_delivery(id, request.actor_id)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn release(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<SettlementReceipt> {
    state
        .engine
        .resolve_dispute(id, request.actor_id, Resolution::Release)
        .await
        .map(Json)
        .map_err(api_error)
}

pub async fn refund(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<ActorRequest>,
) -> ApiResult<SettlementReceipt> {
    state
        .engine
        .resolve_dispute(id, request.actor_id, Resolution::Refund)
        .await
        .map(Json)
        .map_err(api_error)
}

/// Providers always get a 200 with the body they expect.
pub async fn webhook(
    State(state): State<AppState>,
    Path((provider, purpose, kind)): Path<(String, String, String)>,
    body: Bytes,
) -> Response {
    let ack = match (purpose.parse::<TransactionKind>(), kind.parse::<CallbackKind>()) {
        (Ok(purpose), Ok(kind)) => {
            state
                .engine
                .handle_callback(&provider, purpose, kind, &body)
                .await
        }
        _ => {
            warn!(provider = %provider, purpose = %purpose, kind = %kind, "webhook on unknown route ignored");
            Acknowledgement::text("OK")
        }
    };

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, ack.content_type)],
        ack.body,
    )
        .into_response()
}

pub async fn health_check() -> &'static str {
    "OK"
}
