mod common;

use bigdecimal::BigDecimal;
use common::*;
use escrow_service::config::EscrowConfig;
use escrow_service::state_machine::OrderStatus;
use escrow_service::store::EscrowStore;
use payment_providers::Acknowledgement;
use shared::{CallbackKind, EventOutcome, NormalizedEvent, TransactionKind, TransactionStatus};

#[tokio::test]
async fn test_success_callback_marks_order_paid() {
    let h = harness(full_capabilities(), EscrowConfig::default()).await;
    let (order, reference) = h.checkout().await;
    assert_eq!(order.status, OrderStatus::Pending);

    let ack = h
        .callback(
            TransactionKind::Collection,
            callback_body(&reference, "success", Some("1000"), Some("RCPT-1")),
        )
        .await;
    assert_eq!(ack, h.provider_ack());

    assert_eq!(h.order(order.id).await.status, OrderStatus::Paid);
    let transactions = h.engine.transactions(order.id).await.unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].status, TransactionStatus::Success);
    assert_eq!(transactions[0].provider_tx_id.as_deref(), Some("RCPT-1"));
}

#[tokio::test]
async fn test_replayed_success_callback_is_a_no_op() {
    let h = harness(full_capabilities(), EscrowConfig::default()).await;
    let (order, reference) = h.checkout().await;
    let body = callback_body(&reference, "success", Some("1000"), Some("RCPT-1"));

    for _ in 0..3 {
        h.callback(TransactionKind::Collection, body.clone()).await;
    }
    // a late contradicting result must not overwrite the settled one
    h.callback(
        TransactionKind::Collection,
        callback_body(&reference, "failure", None, None),
    )
    .await;

    let transactions = h.engine.transactions(order.id).await.unwrap();
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].status, TransactionStatus::Success);

    let history = h.engine.orders().history(order.id).await.unwrap();
    let paid_transitions = history
        .iter()
        .filter(|r| r.to_status == OrderStatus::Paid && r.from_status == Some(OrderStatus::Pending))
        .count();
    assert_eq!(paid_transitions, 1);
}

#[tokio::test]
async fn test_concurrent_duplicate_callbacks_settle_once() {
    let h = harness(full_capabilities(), EscrowConfig::default()).await;
    let (order, reference) = h.checkout().await;
    let body = callback_body(&reference, "success", Some("1000"), Some("RCPT-1"));

    tokio::join!(
        h.callback(TransactionKind::Collection, body.clone()),
        h.callback(TransactionKind::Collection, body.clone()),
    );

    let history = h.engine.orders().history(order.id).await.unwrap();
    assert_eq!(
        history
            .iter()
            .filter(|r| r.to_status == OrderStatus::Paid && r.from_status != Some(OrderStatus::Paid))
            .count(),
        1
    );
    assert_eq!(h.order(order.id).await.status, OrderStatus::Paid);
}

#[tokio::test]
async fn test_underpaid_collection_still_marks_paid() {
    let h = harness(full_capabilities(), EscrowConfig::default()).await;
    let (order, reference) = h.checkout().await;

    h.callback(
        TransactionKind::Collection,
        callback_body(&reference, "success", Some("500"), Some("RCPT-1")),
    )
    .await;

    assert_eq!(h.order(order.id).await.status, OrderStatus::Paid);
    let history = h.engine.orders().history(order.id).await.unwrap();
    assert!(history.iter().any(|r| r.reason.contains("underpaid")));
}

#[tokio::test]
async fn test_shortfall_beyond_tolerance_holds_order_for_review() {
    let config = EscrowConfig {
        underpayment_tolerance: Some(BigDecimal::from(100)),
        ..ops_config()
    };
    let h = harness(full_capabilities(), config).await;
    let (order, reference) = h.checkout().await;

    h.callback(
        TransactionKind::Collection,
        callback_body(&reference, "success", Some("500"), Some("RCPT-1")),
    )
    .await;

    assert_eq!(h.order(order.id).await.status, OrderStatus::Pending);
    let transactions = h.engine.transactions(order.id).await.unwrap();
    assert_eq!(transactions[0].status, TransactionStatus::Success);

    let outbox = h.store.pending_notifications(100).await.unwrap();
    assert!(outbox
        .iter()
        .any(|e| e.notification.recipient.email.as_deref() == Some("ops@escrow.test")));
}

#[tokio::test]
async fn test_failed_collection_leaves_order_pending_for_retry() {
    let h = harness(full_capabilities(), EscrowConfig::default()).await;
    let (order, reference) = h.checkout().await;

    h.callback(
        TransactionKind::Collection,
        callback_body(&reference, "failure", None, None),
    )
    .await;
    assert_eq!(h.order(order.id).await.status, OrderStatus::Pending);

    let retry = h
        .engine
        .request_collection(order.id, h.buyer, Some("254711111111".to_string()))
        .await
        .unwrap();
    assert_eq!(retry.transaction.status, TransactionStatus::Pending);
    assert_ne!(retry.transaction.correlation_ref, reference);

    h.callback(
        TransactionKind::Collection,
        callback_body(&retry.transaction.correlation_ref, "success", None, Some("RCPT-2")),
    )
    .await;
    assert_eq!(h.order(order.id).await.status, OrderStatus::Paid);
}

#[tokio::test]
async fn test_timeout_notice_settles_through_status_query() {
    let h = harness(full_capabilities(), EscrowConfig::default()).await;
    let (order, reference) = h.checkout().await;
    h.provider.script_answer(
        NormalizedEvent::new(reference.clone(), EventOutcome::Success).with_provider_tx_id("RCPT-9"),
    );

    let ack = h
        .engine
        .handle_timeout(
            PROVIDER,
            TransactionKind::Collection,
            &callback_body(&reference, "timeout", None, None),
        )
        .await;
    assert_eq!(ack, h.provider_ack());

    assert_eq!(h.order(order.id).await.status, OrderStatus::Paid);
    let transactions = h.engine.transactions(order.id).await.unwrap();
    assert_eq!(transactions[0].provider_tx_id.as_deref(), Some("RCPT-9"));
}

#[tokio::test]
async fn test_ambiguous_result_waits_for_definitive_answer() {
    let h = harness(full_capabilities(), EscrowConfig::default()).await;
    let (order, reference) = h.checkout().await;

    h.callback(
        TransactionKind::Collection,
        callback_body(&reference, "pending", None, None),
    )
    .await;

    assert_eq!(h.order(order.id).await.status, OrderStatus::Pending);
    let transactions = h.engine.transactions(order.id).await.unwrap();
    assert_eq!(transactions[0].status, TransactionStatus::Pending);
}

#[tokio::test]
async fn test_unknown_reversal_reference_is_acknowledged() {
    let h = harness(full_capabilities(), EscrowConfig::default()).await;
    let order = h.paid_order().await;

    let ack = h
        .callback(
            TransactionKind::Reversal,
            callback_body("FP-UNKNOWN", "success", None, None),
        )
        .await;
    assert_eq!(ack, h.provider_ack());

    assert_eq!(h.order(order.id).await.status, OrderStatus::Paid);
    assert_eq!(h.engine.transactions(order.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_garbage_payload_is_acknowledged() {
    let h = harness(full_capabilities(), EscrowConfig::default()).await;
    let (order, _) = h.checkout().await;

    let ack = h
        .engine
        .handle_callback(PROVIDER, TransactionKind::Collection, CallbackKind::Result, b"{not json")
        .await;
    assert_eq!(ack, h.provider_ack());
    assert_eq!(h.order(order.id).await.status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_unconfigured_provider_gets_plain_ok() {
    let h = harness(full_capabilities(), EscrowConfig::default()).await;
    let ack = h
        .engine
        .handle_callback("nobody", TransactionKind::Collection, CallbackKind::Result, b"{}")
        .await;
    assert_eq!(ack, Acknowledgement::text("OK"));
}
