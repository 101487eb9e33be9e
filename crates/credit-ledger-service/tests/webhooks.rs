//! Webhook reconciliation integration tests.

mod common;

use chrono::{Duration, Utc};
use common::{event, payment_intent_event, sign, TestHarness};
use serde_json::json;

use credit_ledger_core::{
    CreditError, PackageType, Role, TransactionId, TransactionStatus, UsageType, UserId,
    WebhookOutcome,
};
use credit_ledger_service::crypto::sign_payload;
use credit_ledger_service::{ServiceConfig, UsageRequest};

async fn pending_purchase(harness: &TestHarness, user_id: UserId) -> TransactionId {
    harness
        .service
        .create_purchase(user_id, Role::Worker, PackageType::Standard, None)
        .await
        .unwrap()
        .id
}

// ============================================================================
// Verification
// ============================================================================

#[tokio::test]
async fn bad_signature_is_rejected_without_side_effects() {
    let harness = TestHarness::new();
    let user_id = UserId::generate();
    let tx_id = pending_purchase(&harness, user_id).await;
    let payload = payment_intent_event("evt_forged", "payment_intent.succeeded", tx_id);

    let forged = sign_payload("whsec_attacker", Utc::now().timestamp(), &payload).unwrap();
    let err = harness
        .service
        .handle_webhook(&payload, &forged)
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::InvalidSignature(_)));
    assert_eq!(err.user_message(), "The request could not be verified");

    assert!(harness.webhook_record("evt_forged").is_none());
    assert_eq!(harness.balance(user_id).current_balance, 0);
}

#[tokio::test]
async fn missing_secret_rejects_everything() {
    let harness = TestHarness::with_config(ServiceConfig::default());
    let payload = event("evt_1", "customer.created", json!({ "id": "cus_1" }));
    let err = harness.deliver(&payload).await.unwrap_err();
    assert!(matches!(err, CreditError::InvalidSignature(_)));
    assert!(harness.webhook_record("evt_1").is_none());
}

#[tokio::test]
async fn malformed_payload_is_rejected() {
    let harness = TestHarness::new();
    let payload = r#"{"id":"evt_bad","data":{}}"#;
    let err = harness
        .service
        .handle_webhook(payload, &sign(payload))
        .await
        .unwrap_err();
    assert!(matches!(err, CreditError::InvalidEventFormat(_)));
    assert!(harness.webhook_record("evt_bad").is_none());
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test]
async fn unhandled_events_are_acknowledged() {
    let harness = TestHarness::new();
    let payload = event("evt_ignored", "customer.created", json!({ "id": "cus_1" }));
    let result = harness.deliver(&payload).await.unwrap();
    assert!(result.processed);
    assert_eq!(result.outcome, WebhookOutcome::Ignored);
    assert!(harness.webhook_record("evt_ignored").unwrap().processed);
}

#[tokio::test]
async fn unknown_transaction_is_dead_lettered_at_once() {
    let harness = TestHarness::new();
    let payload = payment_intent_event(
        "evt_orphan",
        "payment_intent.succeeded",
        TransactionId::generate(),
    );
    let result = harness.deliver(&payload).await.unwrap();
    assert!(!result.processed);
    assert!(matches!(result.outcome, WebhookOutcome::DeadLettered { .. }));

    let dead = harness.service.webhooks().list_dead_letters(10).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].stripe_event_id, "evt_orphan");
    assert_eq!(dead[0].retry_count, 1);

    // Redelivery returns the parked result.
    assert_eq!(harness.deliver(&payload).await.unwrap(), result);
}

#[tokio::test]
async fn correlates_by_gateway_reference() {
    let harness = TestHarness::new();
    let user_id = UserId::generate();
    let tx_id = pending_purchase(&harness, user_id).await;
    harness
        .service
        .attach_gateway_reference(tx_id, "pi_attached")
        .await
        .unwrap();

    let payload = event(
        "evt_by_reference",
        "charge.succeeded",
        json!({ "id": "ch_1", "payment_intent": "pi_attached" }),
    );
    // charge.succeeded is not acted on; the payment intent event is.
    assert_eq!(
        harness.deliver(&payload).await.unwrap().outcome,
        WebhookOutcome::Ignored
    );

    let payload = event(
        "evt_pi_succeeded",
        "payment_intent.succeeded",
        json!({ "id": "pi_attached", "object": "payment_intent" }),
    );
    let result = harness.deliver(&payload).await.unwrap();
    assert_eq!(result.outcome, WebhookOutcome::TransactionCompleted);
    assert_eq!(result.transaction_id, Some(tx_id));
    assert_eq!(harness.balance(user_id).current_balance, 30);
}

#[tokio::test]
async fn dispute_is_flagged_without_balance_change() {
    let harness = TestHarness::new();
    let user_id = UserId::generate();
    let tx_id = pending_purchase(&harness, user_id).await;
    harness
        .deliver(&payment_intent_event("evt_paid", "payment_intent.succeeded", tx_id))
        .await
        .unwrap();

    let dispute = event(
        "evt_dispute",
        "charge.dispute.created",
        json!({
            "id": "dp_1",
            "charge": "ch_1",
            "metadata": { "transaction_id": tx_id.to_string() }
        }),
    );
    let result = harness.deliver(&dispute).await.unwrap();
    assert!(result.processed);
    assert_eq!(result.outcome, WebhookOutcome::FlaggedForReview);
    assert_eq!(result.transaction_id, Some(tx_id));
    assert_eq!(harness.balance(user_id).current_balance, 30);
}

// ============================================================================
// Retries and dead letters
// ============================================================================

#[tokio::test]
async fn transient_failure_is_retried_by_the_sweeper() {
    let harness = TestHarness::new();
    let user_id = UserId::generate();
    let tx_id = pending_purchase(&harness, user_id).await;
    let payload = payment_intent_event("evt_flaky", "payment_intent.succeeded", tx_id);

    harness.store.fail_next_commits(1);
    let result = harness.deliver(&payload).await.unwrap();
    assert!(!result.processed);
    let WebhookOutcome::RetryScheduled {
        attempt,
        next_retry_at,
    } = result.outcome
    else {
        panic!("expected a scheduled retry, got {:?}", result.outcome);
    };
    assert_eq!(attempt, 1);
    assert!(next_retry_at > Utc::now() + Duration::seconds(20));
    assert_eq!(harness.balance(user_id).current_balance, 0);

    let record = harness.webhook_record("evt_flaky").unwrap();
    assert_eq!(record.retry_count, 1);
    assert!(!record.processed);

    // Not due yet.
    let report = harness.service.sweeper().retry_due(Utc::now()).await.unwrap();
    assert_eq!(report.attempted, 0);

    let report = harness
        .service
        .sweeper()
        .retry_due(Utc::now() + Duration::minutes(1))
        .await
        .unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.processed, 1);
    assert_eq!(harness.balance(user_id).current_balance, 30);

    let redelivered = harness.deliver(&payload).await.unwrap();
    assert!(redelivered.processed);
    assert_eq!(redelivered.outcome, WebhookOutcome::TransactionCompleted);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_and_can_be_requeued() {
    let mut config = ServiceConfig::with_webhook_secret(common::SECRET);
    config.webhook.max_attempts = 2;
    let harness = TestHarness::with_config(config);
    let user_id = UserId::generate();
    let tx_id = pending_purchase(&harness, user_id).await;
    let payload = payment_intent_event("evt_stubborn", "payment_intent.succeeded", tx_id);

    harness.store.fail_next_commits(100);
    let first = harness.deliver(&payload).await.unwrap();
    assert!(matches!(first.outcome, WebhookOutcome::RetryScheduled { attempt: 1, .. }));

    let report = harness
        .service
        .sweeper()
        .retry_due(Utc::now() + Duration::hours(2))
        .await
        .unwrap();
    assert_eq!(report.dead_lettered, 1);
    let dead = harness.service.webhooks().list_dead_letters(10).unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 2);

    // An operator fixes the cause and requeues.
    harness.store.fail_next_commits(0);
    let requeued = harness
        .service
        .webhooks()
        .requeue_dead_letter("evt_stubborn")
        .await
        .unwrap();
    assert!(!requeued.dead_lettered);
    assert_eq!(requeued.retry_count, 0);
    assert!(harness
        .service
        .webhooks()
        .requeue_dead_letter("evt_stubborn")
        .await
        .is_err());

    let report = harness
        .service
        .sweeper()
        .retry_due(Utc::now() + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.processed, 1);
    assert_eq!(harness.balance(user_id).current_balance, 30);
    assert!(harness.service.webhooks().list_dead_letters(10).unwrap().is_empty());
}

// ============================================================================
// Stuck pending
// ============================================================================

#[tokio::test]
async fn stuck_purchases_are_reported_not_failed() {
    let harness = TestHarness::new();
    let user_id = UserId::generate();
    harness.fund(user_id, 10).await;
    let tx_id = pending_purchase(&harness, user_id).await;

    let mut hold = UsageRequest::new(UsageType::JobApplication, "job-1", "job");
    hold.hold = true;
    harness.service.use_credits_with(user_id, hold).await.unwrap();

    let sweeper = harness.service.sweeper();
    assert!(sweeper.stuck_pending(Utc::now()).unwrap().is_empty());

    let stuck = sweeper
        .stuck_pending(Utc::now() + Duration::minutes(61))
        .unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, tx_id);
    assert_eq!(
        harness.service.ledger().get_transaction(&tx_id).unwrap().status,
        TransactionStatus::Pending
    );
}
