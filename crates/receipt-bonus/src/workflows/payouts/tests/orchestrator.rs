use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};
use tokio::sync::mpsc;

use super::common::*;
use crate::workflows::payouts::{
    spawn_acceptance_consumer, spawn_payout_worker, AlertKind, Ledger, OrchestratorError,
    PayeeDirectory, PayoutConfig, PayoutStatus, ProviderAck, ProviderError, ProviderStatus,
    ResubmitRequest, UserFacingReason,
};
use crate::workflows::receipts::{ReceiptId, UserId};

#[tokio::test]
async fn accepted_receipt_is_paid_once() {
    let h = harness();

    let transaction = h
        .orchestrator
        .handle_acceptance(&accepted("r-1", "user-1"))
        .await
        .expect("payout runs");

    assert_eq!(transaction.status, PayoutStatus::Succeeded);
    assert_eq!(transaction.amount_minor, 100);
    assert_eq!(transaction.currency, "UAH");
    assert_eq!(transaction.provider_reference.as_deref(), Some("pm-1"));
    assert!(transaction.lease.is_none());

    let requests = h.provider.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].msisdn, "380671234567");
    assert_eq!(requests[0].idempotency_key.0, "rcpt-r-1-g0");

    let outcomes = h.notifier.outcomes();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, PayoutStatus::Succeeded);
    assert!(h.notifier.alerts().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicate_acceptances_submit_once() {
    let h = harness();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let orchestrator = h.orchestrator.clone();
        tasks.push(tokio::spawn(async move {
            orchestrator
                .handle_acceptance(&accepted("r-dup", "user-1"))
                .await
        }));
    }
    for task in tasks {
        task.await.expect("task joins").expect("acceptance handled");
    }

    assert_eq!(h.provider.submit_count(), 1);
    let history = h
        .ledger
        .history_for_receipt(&ReceiptId("r-dup".to_string()))
        .expect("history");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, PayoutStatus::Succeeded);
    assert_eq!(h.notifier.outcomes().len(), 1);
}

#[tokio::test]
async fn redelivered_acceptance_after_success_is_a_no_op() {
    let h = harness();
    let event = accepted("r-2", "user-1");

    let first = h.orchestrator.handle_acceptance(&event).await.expect("first");
    let second = h.orchestrator.handle_acceptance(&event).await.expect("second");

    assert_eq!(first.transaction_id, second.transaction_id);
    assert_eq!(second.status, PayoutStatus::Succeeded);
    assert_eq!(h.provider.submit_count(), 1);
}

#[tokio::test]
async fn transient_failures_back_off_then_fail_permanently() {
    let h = harness();
    for _ in 0..4 {
        h.provider.push_submit(Err(ProviderError::Timeout));
    }

    let transaction = h
        .orchestrator
        .handle_acceptance(&accepted("r-3", "user-1"))
        .await
        .expect("first attempt");

    assert_eq!(transaction.status, PayoutStatus::FailedRetryable);
    assert_eq!(transaction.retry_count, 1);
    assert_eq!(transaction.next_attempt_at, Some(now() + Duration::seconds(1)));
    assert_eq!(h.orchestrator.retry_due().await.expect("sweep"), 0);

    for (delay, expected_next) in [(1, 2), (2, 4)] {
        h.clock.advance(Duration::seconds(delay));
        assert_eq!(h.orchestrator.retry_due().await.expect("sweep"), 1);
        let current = h
            .ledger
            .fetch(&transaction.transaction_id)
            .expect("fetch")
            .expect("exists");
        assert_eq!(current.status, PayoutStatus::FailedRetryable);
        assert_eq!(
            current.next_attempt_at,
            Some(h.clock_now() + Duration::seconds(expected_next))
        );
    }

    h.clock.advance(Duration::seconds(4));
    assert_eq!(h.orchestrator.retry_due().await.expect("sweep"), 1);

    let failed = h
        .ledger
        .fetch(&transaction.transaction_id)
        .expect("fetch")
        .expect("exists");
    assert_eq!(failed.status, PayoutStatus::FailedPermanent);
    assert_eq!(failed.retry_count, 4);
    assert_eq!(failed.next_attempt_at, None);
    assert_eq!(
        failed.user_facing_reason(),
        Some(UserFacingReason::TemporaryProblem)
    );

    let keys: Vec<String> = h
        .provider
        .requests()
        .into_iter()
        .map(|request| request.idempotency_key.0)
        .collect();
    assert_eq!(keys, vec!["rcpt-r-3-g0".to_string(); 4]);

    let alerts = h.notifier.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::PermanentFailure);
    assert_eq!(alerts[0].details.get("error_code").map(String::as_str), Some("timeout"));
}

#[tokio::test]
async fn provider_rejection_is_not_retried() {
    let h = harness();
    h.provider.push_submit(Err(ProviderError::Rejected {
        code: "limit_exceeded".to_string(),
    }));

    let transaction = h
        .orchestrator
        .handle_acceptance(&accepted("r-4", "user-1"))
        .await
        .expect("attempt");

    assert_eq!(transaction.status, PayoutStatus::FailedPermanent);
    assert_eq!(transaction.retry_count, 0);
    assert_eq!(
        transaction.user_facing_reason(),
        Some(UserFacingReason::Rejected)
    );
    h.clock.advance(Duration::hours(1));
    assert_eq!(h.orchestrator.retry_due().await.expect("sweep"), 0);
    assert_eq!(h.provider.submit_count(), 1);
}

#[tokio::test]
async fn unresolvable_recipient_fails_without_calling_provider() {
    let h = harness();
    h.recipients
        .register(UserId("user-bad".to_string()), "12345")
        .expect("register");

    let missing = h
        .orchestrator
        .handle_acceptance(&accepted("r-5", "user-unknown"))
        .await
        .expect("handled");
    let invalid = h
        .orchestrator
        .handle_acceptance(&accepted("r-6", "user-bad"))
        .await
        .expect("handled");

    for transaction in [&missing, &invalid] {
        assert_eq!(transaction.status, PayoutStatus::FailedPermanent);
        assert_eq!(transaction.msisdn, None);
        assert_eq!(
            transaction.user_facing_reason(),
            Some(UserFacingReason::InvalidRecipient)
        );
    }
    assert_eq!(h.provider.submit_count(), 0);
    let kinds: Vec<AlertKind> = h.notifier.alerts().iter().map(|alert| alert.kind).collect();
    assert_eq!(kinds, vec![AlertKind::InvalidRecipient; 2]);
}

#[tokio::test]
async fn directory_outage_defers_the_attempt_instead_of_dropping_it() {
    let h = harness_with_flaky_directory(1);

    let deferred = h
        .orchestrator
        .handle_acceptance(&accepted("r-lost", "user-1"))
        .await
        .expect("transaction recorded despite the outage");

    assert_eq!(deferred.status, PayoutStatus::Created);
    assert_eq!(deferred.msisdn, None);
    assert_eq!(deferred.retry_count, 0);
    assert_eq!(deferred.next_attempt_at, Some(now() + Duration::seconds(1)));
    assert!(deferred.lease.is_none());
    assert_eq!(h.provider.submit_count(), 0);
    assert!(h.notifier.alerts().is_empty());

    h.clock.advance(Duration::seconds(1));
    assert_eq!(h.orchestrator.retry_due().await.expect("sweep"), 1);

    let paid = h
        .ledger
        .active_for_receipt(&ReceiptId("r-lost".to_string()))
        .expect("lookup")
        .expect("transaction exists");
    assert_eq!(paid.status, PayoutStatus::Succeeded);
    assert_eq!(paid.msisdn.as_deref(), Some("380671234567"));
    assert_eq!(paid.retry_count, 0);
    assert_eq!(h.provider.submit_count(), 1);
}

#[tokio::test]
async fn attempt_from_a_stale_snapshot_keeps_the_backoff() {
    let h = harness();
    h.provider.push_submit(Err(ProviderError::Timeout));
    let failed = h
        .orchestrator
        .handle_acceptance(&accepted("r-early", "user-1"))
        .await
        .expect("first attempt");
    assert_eq!(failed.status, PayoutStatus::FailedRetryable);

    let early = h
        .orchestrator
        .attempt(&failed.transaction_id)
        .await
        .expect("attempt skipped");
    assert_eq!(early.status, PayoutStatus::FailedRetryable);
    assert_eq!(early.next_attempt_at, failed.next_attempt_at);
    assert!(early.lease.is_none());
    assert_eq!(h.provider.submit_count(), 1);

    h.clock.advance(Duration::seconds(1));
    let retried = h
        .orchestrator
        .attempt(&failed.transaction_id)
        .await
        .expect("attempt runs");
    assert_eq!(retried.status, PayoutStatus::Succeeded);
    assert_eq!(h.provider.submit_count(), 2);
}

#[tokio::test]
async fn payee_is_routed_by_operator_prefix() {
    let h = harness_with(PayoutConfig {
        payees: PayeeDirectory {
            default: Some("payee-default".to_string()),
            kyivstar: Some("payee-kyivstar".to_string()),
            vodafone: None,
            lifecell: None,
        },
        ..payout_config()
    });
    h.recipients
        .register(UserId("user-2".to_string()), "+380 50 123 4567")
        .expect("register");

    h.orchestrator
        .handle_acceptance(&accepted("r-7", "user-1"))
        .await
        .expect("kyivstar");
    h.orchestrator
        .handle_acceptance(&accepted("r-8", "user-2"))
        .await
        .expect("vodafone");

    let payees: Vec<Option<String>> = h
        .provider
        .requests()
        .into_iter()
        .map(|request| request.payee_id)
        .collect();
    assert_eq!(
        payees,
        vec![
            Some("payee-kyivstar".to_string()),
            Some("payee-default".to_string())
        ]
    );
}

#[tokio::test]
async fn daily_budget_defers_to_next_utc_day() {
    let h = harness_with(PayoutConfig {
        daily_success_cap: 1,
        ..payout_config()
    });

    let first = h
        .orchestrator
        .handle_acceptance(&accepted("r-9", "user-1"))
        .await
        .expect("first");
    let deferred = h
        .orchestrator
        .handle_acceptance(&accepted("r-10", "user-1"))
        .await
        .expect("second");

    let midnight = Utc.with_ymd_and_hms(2025, 6, 3, 0, 0, 0).unwrap();
    assert_eq!(first.status, PayoutStatus::Succeeded);
    assert_eq!(deferred.status, PayoutStatus::Created);
    assert_eq!(deferred.next_attempt_at, Some(midnight));
    assert_eq!(h.orchestrator.retry_due().await.expect("sweep"), 0);

    h.clock.set(midnight);
    assert_eq!(h.orchestrator.retry_due().await.expect("sweep"), 1);

    let paid = h
        .ledger
        .fetch(&deferred.transaction_id)
        .expect("fetch")
        .expect("exists");
    assert_eq!(paid.status, PayoutStatus::Succeeded);
    assert_eq!(h.provider.submit_count(), 2);
}

#[tokio::test]
async fn stale_in_flight_is_settled_by_status_query() {
    let h = harness();
    h.provider.push_submit(Ok(ProviderAck::Accepted {
        provider_reference: Some("pm-77".to_string()),
    }));

    let transaction = h
        .orchestrator
        .handle_acceptance(&accepted("r-11", "user-1"))
        .await
        .expect("accepted by provider");
    assert_eq!(transaction.status, PayoutStatus::InFlight);
    assert_eq!(h.orchestrator.reconcile_stale().await.expect("sweep"), 0);
    assert!(h.provider.status_queries().is_empty());

    h.clock.advance(Duration::seconds(301));
    h.provider.push_status(Ok(ProviderStatus::Succeeded {
        provider_reference: None,
    }));
    assert_eq!(h.orchestrator.reconcile_stale().await.expect("sweep"), 1);

    let settled = h
        .ledger
        .fetch(&transaction.transaction_id)
        .expect("fetch")
        .expect("exists");
    assert_eq!(settled.status, PayoutStatus::Succeeded);
    assert_eq!(settled.provider_reference.as_deref(), Some("pm-77"));
    assert_eq!(
        h.provider.status_queries(),
        vec![transaction.idempotency_key.clone()]
    );
    assert_eq!(h.provider.submit_count(), 1);
}

#[tokio::test]
async fn unreceived_request_is_resent_with_the_same_key() {
    let h = harness();
    h.provider.push_submit(Ok(ProviderAck::Accepted {
        provider_reference: None,
    }));
    let transaction = h
        .orchestrator
        .handle_acceptance(&accepted("r-12", "user-1"))
        .await
        .expect("accepted");

    h.clock.advance(Duration::seconds(301));
    h.provider.push_status(Ok(ProviderStatus::Unknown));
    assert_eq!(h.orchestrator.reconcile_stale().await.expect("sweep"), 1);

    let retryable = h
        .ledger
        .fetch(&transaction.transaction_id)
        .expect("fetch")
        .expect("exists");
    assert_eq!(retryable.status, PayoutStatus::FailedRetryable);
    assert_eq!(
        retryable.last_error.as_ref().map(|failure| failure.code.as_str()),
        Some("not_received")
    );

    h.clock.advance(Duration::seconds(1));
    assert_eq!(h.orchestrator.retry_due().await.expect("sweep"), 1);

    let requests = h.provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].idempotency_key, requests[1].idempotency_key);
    let paid = h
        .ledger
        .fetch(&transaction.transaction_id)
        .expect("fetch")
        .expect("exists");
    assert_eq!(paid.status, PayoutStatus::Succeeded);
}

#[tokio::test]
async fn pending_status_keeps_waiting() {
    let h = harness();
    h.provider.push_submit(Ok(ProviderAck::Accepted {
        provider_reference: None,
    }));
    let transaction = h
        .orchestrator
        .handle_acceptance(&accepted("r-13", "user-1"))
        .await
        .expect("accepted");

    h.clock.advance(Duration::seconds(301));
    assert_eq!(h.orchestrator.reconcile_stale().await.expect("sweep"), 0);

    let waiting = h
        .ledger
        .fetch(&transaction.transaction_id)
        .expect("fetch")
        .expect("exists");
    assert_eq!(waiting.status, PayoutStatus::InFlight);
    assert_eq!(waiting.in_flight_since, Some(h.clock_now()));
    assert_eq!(h.orchestrator.reconcile_stale().await.expect("sweep"), 0);
    assert_eq!(h.provider.status_queries().len(), 1);
}

#[tokio::test]
async fn operator_resubmission_creates_a_new_generation() {
    let h = harness();
    let failed = h
        .orchestrator
        .handle_acceptance(&accepted("r-14", "user-3"))
        .await
        .expect("handled");
    assert_eq!(failed.status, PayoutStatus::FailedPermanent);

    h.recipients
        .register(UserId("user-3".to_string()), "0931112233")
        .expect("register");
    let replacement = h
        .orchestrator
        .resubmit(
            &failed.transaction_id,
            &ResubmitRequest {
                operator: "ops-anna".to_string(),
                msisdn: None,
            },
        )
        .await
        .expect("resubmitted");

    assert_eq!(replacement.generation, 1);
    assert_eq!(replacement.idempotency_key.0, "rcpt-r-14-g1");
    assert_eq!(replacement.status, PayoutStatus::Succeeded);
    assert_ne!(replacement.transaction_id, failed.transaction_id);

    let previous = h
        .ledger
        .fetch(&failed.transaction_id)
        .expect("fetch")
        .expect("kept");
    assert!(previous.superseded);
    assert_eq!(previous.status, PayoutStatus::FailedPermanent);

    let history = h
        .orchestrator
        .transactions_for_receipt(&ReceiptId("r-14".to_string()))
        .expect("history");
    assert_eq!(history.len(), 2);

    let again = h
        .orchestrator
        .resubmit(
            &failed.transaction_id,
            &ResubmitRequest {
                operator: "ops-anna".to_string(),
                msisdn: None,
            },
        )
        .await
        .expect_err("already superseded");
    assert!(matches!(
        again,
        OrchestratorError::NotResubmittable {
            superseded: true,
            ..
        }
    ));
}

#[tokio::test]
async fn resubmission_requires_operator_and_failed_state() {
    let h = harness();
    let paid = h
        .orchestrator
        .handle_acceptance(&accepted("r-15", "user-1"))
        .await
        .expect("paid");

    let anonymous = h
        .orchestrator
        .resubmit(
            &paid.transaction_id,
            &ResubmitRequest {
                operator: " ".to_string(),
                msisdn: None,
            },
        )
        .await
        .expect_err("operator required");
    let succeeded = h
        .orchestrator
        .resubmit(
            &paid.transaction_id,
            &ResubmitRequest {
                operator: "ops-anna".to_string(),
                msisdn: None,
            },
        )
        .await
        .expect_err("not failed");

    assert!(matches!(anonymous, OrchestratorError::MissingOperator));
    assert!(matches!(
        succeeded,
        OrchestratorError::NotResubmittable {
            status: PayoutStatus::Succeeded,
            superseded: false
        }
    ));
}

#[tokio::test]
async fn acceptance_consumer_drives_payouts() {
    let h = harness();
    let (sender, receiver) = mpsc::channel(8);
    let consumer = spawn_acceptance_consumer(h.orchestrator.clone(), receiver);

    sender
        .send(accepted("r-16", "user-1"))
        .await
        .expect("channel open");
    for _ in 0..100 {
        if h.notifier.outcomes().len() == 1 {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    consumer.shutdown().await;

    assert_eq!(h.provider.submit_count(), 1);
    assert_eq!(h.notifier.outcomes()[0].status, PayoutStatus::Succeeded);
}

#[tokio::test]
async fn background_worker_retries_due_transactions() {
    let h = harness();
    h.provider.push_submit(Err(ProviderError::Unavailable { status: 503 }));
    let transaction = h
        .orchestrator
        .handle_acceptance(&accepted("r-17", "user-1"))
        .await
        .expect("first attempt");
    assert_eq!(transaction.status, PayoutStatus::FailedRetryable);

    h.clock.advance(Duration::seconds(1));
    let worker = spawn_payout_worker(h.orchestrator.clone(), StdDuration::from_millis(5));
    for _ in 0..100 {
        if h.provider.submit_count() == 2 {
            break;
        }
        tokio::time::sleep(StdDuration::from_millis(5)).await;
    }
    worker.shutdown().await;

    let paid = h
        .ledger
        .fetch(&transaction.transaction_id)
        .expect("fetch")
        .expect("exists");
    assert_eq!(paid.status, PayoutStatus::Succeeded);
}
