mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use common::*;
use escrow_service::api::{create_router, AppState};
use escrow_service::config::EscrowConfig;
use escrow_service::models::{NewTransaction, Order, Transaction};
use escrow_service::state_machine::OrderStatus;
use payment_providers::bank::BankTransferProvider;
use payment_providers::card::CardGatewayProvider;
use payment_providers::config::{BankConfig, CardConfig, MpesaConfig};
use payment_providers::mpesa::MpesaProvider;
use payment_providers::{ProviderRegistry, ProvidersConfig};
use serde_json::{json, Value};
use shared::{CallbackKind, PaymentMethod, TransactionKind, TransactionStatus};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

// nothing listens here, so every status query fails fast
const UNREACHABLE: &str = "http://127.0.0.1:9";

fn providers_config() -> ProvidersConfig {
    ProvidersConfig {
        callback_base_url: "https://escrow.test".to_string(),
        http_timeout: Duration::from_secs(2),
        mpesa: None,
        bank: None,
        card: None,
    }
}

fn real_adapters(registry: &mut ProviderRegistry) {
    let providers = providers_config();
    let mpesa = MpesaConfig {
        base_url: UNREACHABLE.to_string(),
        consumer_key: "key".to_string(),
        consumer_secret: "secret".to_string(),
        shortcode: "174379".to_string(),
        passkey: "passkey".to_string(),
        b2c: None,
    };
    let bank = BankConfig {
        base_url: UNREACHABLE.to_string(),
        api_key: "key".to_string(),
        merchant_id: "M-1".to_string(),
    };
    let card = CardConfig {
        base_url: UNREACHABLE.to_string(),
        secret_key: "sk_test".to_string(),
        redirect_url: "https://shop.test/paid".to_string(),
    };
    registry.register(
        PaymentMethod::Mpesa,
        Arc::new(MpesaProvider::new(mpesa, &providers).unwrap()),
    );
    registry.register(
        PaymentMethod::BankTransfer,
        Arc::new(BankTransferProvider::new(bank, &providers).unwrap()),
    );
    registry.register(
        PaymentMethod::Card,
        Arc::new(CardGatewayProvider::new(card, &providers).unwrap()),
    );
}

async fn real_harness() -> Harness {
    harness_with(full_capabilities(), EscrowConfig::default(), real_adapters).await
}

/// An order whose collection the provider has accepted under `reference`.
async fn awaiting_collection(
    h: &Harness,
    method: PaymentMethod,
    provider: &str,
    reference: &str,
) -> (Order, Transaction) {
    let mut request = h.order_request();
    request.payment_method = method;
    let order = h.engine.orders().create_order(request).await.unwrap();
    let transaction = h
        .engine
        .ledger()
        .record(NewTransaction {
            order_id: order.id,
            user_id: Some(h.buyer),
            provider: provider.to_string(),
            correlation_ref: reference.to_string(),
            kind: TransactionKind::Collection,
            amount: order.amount.clone(),
            status: TransactionStatus::Pending,
            description: "collection initiated".to_string(),
        })
        .await
        .unwrap();
    (order, transaction)
}

fn webhook(uri: &str, content_type: &str, body: String) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .unwrap()
}

fn stk_callback(checkout_request_id: &str) -> String {
    json!({
        "Body": {
            "stkCallback": {
                "MerchantRequestID": "29115-34620561-1",
                "CheckoutRequestID": checkout_request_id,
                "ResultCode": 0,
                "ResultDesc": "The service request is processed successfully.",
                "CallbackMetadata": {
                    "Item": [
                        { "Name": "Amount", "Value": 1000.00 },
                        { "Name": "MpesaReceiptNumber", "Value": "NLJ7RT61SV" },
                        { "Name": "PhoneNumber", "Value": 254708374149u64 }
                    ]
                }
            }
        }
    })
    .to_string()
}

#[tokio::test]
async fn test_mpesa_stk_callback_through_the_webhook_route() {
    let h = real_harness().await;
    let (order, transaction) =
        awaiting_collection(&h, PaymentMethod::Mpesa, "mpesa", "ws_CO_191220191020363925").await;
    let app = create_router(AppState {
        engine: h.engine.clone(),
    });

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(webhook(
                "/webhooks/mpesa/collection/result",
                "application/json",
                stk_callback("ws_CO_191220191020363925"),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let ack: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(ack["ResultCode"], 0);
    }

    assert_eq!(h.order(order.id).await.status, OrderStatus::Paid);
    let settled = h.engine.ledger().find(transaction.id).await.unwrap();
    assert_eq!(settled.status, TransactionStatus::Success);
    assert_eq!(settled.provider_tx_id.as_deref(), Some("NLJ7RT61SV"));

    let history = h.engine.orders().history(order.id).await.unwrap();
    let paid = history
        .iter()
        .filter(|r| r.to_status == OrderStatus::Paid && r.from_status == Some(OrderStatus::Pending))
        .count();
    assert_eq!(paid, 1);
}

#[tokio::test]
async fn test_bank_form_post_is_confirmed_before_settling() {
    let h = real_harness().await;
    let (order, transaction) =
        awaiting_collection(&h, PaymentMethod::BankTransfer, "bank", "BNK-42").await;
    let app = create_router(AppState {
        engine: h.engine.clone(),
    });

    let response = app
        .oneshot(webhook(
            "/webhooks/bank/collection/result",
            "application/x-www-form-urlencoded",
            "reference=BNK-42&status=00&amount=1000.00&bank_ref=FT2301".to_string(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"OK");

    let unconfirmed = h.engine.ledger().find(transaction.id).await.unwrap();
    assert_eq!(unconfirmed.status, TransactionStatus::Pending);
    assert!(unconfirmed.provider_tx_id.is_none());
    assert_eq!(h.order(order.id).await.status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_card_webhook_alone_does_not_mark_paid() {
    let h = real_harness().await;
    let (order, transaction) =
        awaiting_collection(&h, PaymentMethod::Card, "card", "CARD-abc").await;
    let body = json!({
        "event": "charge.completed",
        "data": {
            "id": 285959875,
            "tx_ref": "CARD-abc",
            "amount": 1000,
            "currency": "KES",
            "status": "successful"
        }
    });

    let ack = h
        .engine
        .handle_callback(
            "card",
            TransactionKind::Collection,
            CallbackKind::Result,
            body.to_string().as_bytes(),
        )
        .await;
    assert_eq!(ack.content_type, "application/json");

    let unconfirmed = h.engine.ledger().find(transaction.id).await.unwrap();
    assert_eq!(unconfirmed.status, TransactionStatus::Pending);
    assert_eq!(h.order(order.id).await.status, OrderStatus::Pending);
}
