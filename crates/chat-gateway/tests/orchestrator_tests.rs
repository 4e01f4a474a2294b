//! End-to-end session lifecycle tests against a scripted provider.

mod common;

use async_trait::async_trait;
use chat_gateway::{GatewayError, StreamEnd};
use common::*;
use credit_ledger::SessionStatus;
use futures::StreamExt;
use mockall::mock;
use provider_bridge::{ChatProvider, ChatRequest, Message, ProviderError, TokenStream};
use std::sync::Arc;
use std::time::Duration;
use stream_relay::{EventKind, ObserverMessage, RelayConfig, StreamEvent};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mock! {
    pub Provider {}

    #[async_trait]
    impl ChatProvider for Provider {
        async fn stream_chat(
            &self,
            request: ChatRequest,
            cancel: CancellationToken,
        ) -> Result<TokenStream, ProviderError>;
    }
}

/// Read primary events up to and including the terminal one.
async fn drain(events: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut seen = Vec::new();
    while let Some(event) = events.recv().await {
        let terminal = event.is_terminal();
        seen.push(event);
        if terminal {
            break;
        }
    }
    seen
}

#[tokio::test]
async fn test_successful_stream_settles_and_refunds() {
    let provider = Arc::new(ScriptedProvider::new(&["Hello", " world"]));
    let orchestrator = orchestrator(provider.clone(), 10).await;

    let mut started = orchestrator
        .start_stream(&student("alice"), request("s-ok"))
        .await
        .unwrap();
    assert_eq!(started.reservation.estimated_credits, 2);
    assert_eq!(started.reservation.allocated_credits, 3);

    let events = drain(&mut started.events).await;
    let kinds: Vec<EventKind> = events.iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![EventKind::Token, EventKind::Token, EventKind::Complete]
    );
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, vec![0, 1, 2]);

    let summary: serde_json::Value = serde_json::from_str(&events[2].payload).unwrap();
    assert_eq!(summary["prompt_tokens"], 1);
    assert_eq!(summary["completion_tokens"], 3);
    assert_eq!(summary["charged_credits"], 1);
    assert_eq!(summary["refunded_credits"], 2);

    let outcome = started.task.await.unwrap();
    assert_eq!(outcome.end, StreamEnd::Completed);
    assert_eq!(outcome.completion_tokens, 3);
    assert_eq!(outcome.tokens, 4);
    let settlement = outcome.settlement.unwrap();
    assert_eq!(settlement.charged_credits + settlement.refunded_credits, 3);

    let ledger = orchestrator.ledger();
    assert_eq!(ledger.credits.balance("alice").await.total_remaining, 9);
    let session = ledger.sessions.get("s-ok").await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.used_credits, Some(1));
    assert!(!orchestrator.relays().is_active("s-ok"));
    assert_eq!(provider.calls(), 1);
}

#[tokio::test]
async fn test_insufficient_credits_never_calls_provider() {
    let mut provider = MockProvider::new();
    provider.expect_stream_chat().times(0);
    let orchestrator = orchestrator(Arc::new(provider), 1).await;

    let err = orchestrator
        .start_stream(&student("alice"), request("s-poor"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        GatewayError::InsufficientCredits {
            required: 3,
            available: 1
        }
    ));
    let ledger = orchestrator.ledger();
    assert_eq!(ledger.credits.balance("alice").await.total_remaining, 1);
    assert!(ledger.sessions.get("s-poor").await.is_none());
}

#[tokio::test]
async fn test_provider_error_mid_stream_aborts() {
    let provider = Arc::new(ScriptedProvider::new(&["partial"]).failing_after("boom"));
    let orchestrator = orchestrator(provider, 10).await;

    let mut started = orchestrator
        .start_stream(&student("alice"), request("s-err"))
        .await
        .unwrap();

    let events = drain(&mut started.events).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].payload, "partial");
    assert_eq!(events[1].kind, EventKind::Error);
    assert!(events[1].payload.contains("boom"));

    let outcome = started.task.await.unwrap();
    assert!(matches!(outcome.end, StreamEnd::ProviderFailed(_)));

    // Generated tokens are charged, the rest of the reservation returned
    let ledger = orchestrator.ledger();
    assert_eq!(ledger.credits.balance("alice").await.total_remaining, 9);
    let session = ledger.sessions.get("s-err").await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.refunded_credits, Some(2));
}

#[tokio::test]
async fn test_stream_timeout_sends_error_and_aborts() {
    let provider = Arc::new(ScriptedProvider::new(&["a"]).hanging());
    let orchestrator = orchestrator_with(provider, 10, Duration::from_millis(100)).await;

    let mut started = orchestrator
        .start_stream(&student("alice"), request("s-slow"))
        .await
        .unwrap();

    let events = drain(&mut started.events).await;
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Error);
    assert!(last.payload.contains("timed out"));

    let outcome = started.task.await.unwrap();
    assert_eq!(outcome.end, StreamEnd::TimedOut);
    let session = orchestrator.ledger().sessions.get("s-slow").await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(
        orchestrator
            .ledger()
            .credits
            .balance("alice")
            .await
            .total_remaining,
        9
    );
}

#[tokio::test]
async fn test_timeout_fires_while_consumer_stalls() {
    let script: Vec<String> = (0..50).map(|i| format!("t{} ", i)).collect();
    let script: Vec<&str> = script.iter().map(String::as_str).collect();
    let provider = Arc::new(ScriptedProvider::new(&script));
    let relay = RelayConfig {
        primary_queue: 4,
        ..RelayConfig::default()
    };
    let orchestrator =
        orchestrator_with_relay(provider, 10, Duration::from_millis(100), relay).await;

    let mut started = orchestrator
        .start_stream(&student("alice"), request("s-stalled"))
        .await
        .unwrap();

    // Connected but never reading until the session has given up
    let outcome = tokio::time::timeout(Duration::from_secs(2), &mut started.task)
        .await
        .expect("session task stuck behind a stalled consumer")
        .unwrap();
    assert_eq!(outcome.end, StreamEnd::TimedOut);

    let ledger = orchestrator.ledger();
    assert_eq!(
        ledger.sessions.get("s-stalled").await.unwrap().status,
        SessionStatus::Failed
    );
    assert_eq!(ledger.credits.balance("alice").await.total_remaining, 9);
    assert!(!orchestrator.relays().is_active("s-stalled"));

    // The queued tokens still arrive in order, followed by the timeout
    let events = drain(&mut started.events).await;
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence, i as u64);
    }
    let last = events.last().unwrap();
    assert_eq!(last.kind, EventKind::Error);
    assert!(last.payload.contains("timed out"));
}

#[tokio::test]
async fn test_prompt_tokens_are_billed() {
    let provider = Arc::new(ScriptedProvider::new(&["ok"]));
    let orchestrator = orchestrator(provider, 10).await;

    let mut long_prompt = request("s-long");
    long_prompt.messages = vec![Message::user("x".repeat(8000))];

    let mut started = orchestrator
        .start_stream(&student("alice"), long_prompt)
        .await
        .unwrap();
    // 2000 prompt + 1000 completion tokens
    assert_eq!(started.reservation.estimated_credits, 3);
    assert_eq!(started.reservation.allocated_credits, 4);

    drain(&mut started.events).await;
    let outcome = started.task.await.unwrap();
    assert_eq!(outcome.tokens, 2001);

    let settlement = outcome.settlement.unwrap();
    assert_eq!(settlement.charged_credits, 3);
    assert_eq!(settlement.refunded_credits, 1);
    assert_eq!(
        orchestrator
            .ledger()
            .credits
            .balance("alice")
            .await
            .total_remaining,
        7
    );
}

#[tokio::test]
async fn test_timeout_while_opening_returns_error() {
    let provider = Arc::new(ScriptedProvider::new(&["late"]).with_open_delay(Duration::from_secs(5)));
    let orchestrator = orchestrator_with(provider, 10, Duration::from_millis(50)).await;

    let err = orchestrator
        .start_stream(&student("alice"), request("s-open-slow"))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::StreamTimeout(_)));
    let ledger = orchestrator.ledger();
    assert_eq!(ledger.credits.balance("alice").await.total_remaining, 10);
    assert_eq!(
        ledger.sessions.get("s-open-slow").await.unwrap().status,
        SessionStatus::Failed
    );
}

#[tokio::test]
async fn test_primary_disconnect_aborts_session() {
    let provider = Arc::new(
        ScriptedProvider::new(&["one", "two", "three", "four"])
            .with_delay(Duration::from_millis(20))
            .hanging(),
    );
    let orchestrator = orchestrator(provider, 10).await;

    let mut started = orchestrator
        .start_stream(&student("alice"), request("s-gone"))
        .await
        .unwrap();

    let first = started.events.recv().await.unwrap();
    assert_eq!(first.payload, "one");
    drop(started.events);

    let outcome = tokio::time::timeout(Duration::from_secs(5), started.task)
        .await
        .expect("session task did not finish")
        .unwrap();
    assert_eq!(outcome.end, StreamEnd::ClientDisconnected);

    let ledger = orchestrator.ledger();
    let session = ledger.sessions.get("s-gone").await.unwrap();
    assert_eq!(session.status, SessionStatus::Failed);
    let balance = ledger.credits.balance("alice").await.total_remaining;
    assert!(balance >= 9, "unused reservation must be refunded, got {}", balance);
    assert!(!orchestrator.relays().is_active("s-gone"));
}

#[tokio::test]
async fn test_open_failure_refunds_everything() {
    let provider = Arc::new(ScriptedProvider::new(&[]).refusing_to_open());
    let orchestrator = orchestrator(provider, 10).await;

    let err = orchestrator
        .start_stream(&student("alice"), request("s-down"))
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Provider(_)));
    let ledger = orchestrator.ledger();
    assert_eq!(ledger.credits.balance("alice").await.total_remaining, 10);
    assert_eq!(
        ledger.sessions.get("s-down").await.unwrap().status,
        SessionStatus::Failed
    );
    assert!(!orchestrator.relays().is_active("s-down"));
}

#[tokio::test]
async fn test_duplicate_session_id_rejected() {
    let provider = Arc::new(ScriptedProvider::new(&["x"]));
    let orchestrator = orchestrator(provider, 10).await;

    let mut started = orchestrator
        .start_stream(&student("alice"), request("s-dup"))
        .await
        .unwrap();
    drain(&mut started.events).await;
    started.task.await.unwrap();

    let err = orchestrator
        .start_stream(&student("alice"), request("s-dup"))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::DuplicateSession(_)));
}

#[tokio::test]
async fn test_invalid_request_rejected_before_reservation() {
    let provider = Arc::new(ScriptedProvider::new(&["x"]));
    let orchestrator = orchestrator(provider.clone(), 10).await;

    let mut empty = request("s-empty");
    empty.messages.clear();
    let err = orchestrator
        .start_stream(&student("alice"), empty)
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::InvalidRequest(_)));
    assert_eq!(provider.calls(), 0);
    assert_eq!(
        orchestrator
            .ledger()
            .credits
            .balance("alice")
            .await
            .total_remaining,
        10
    );
}

#[tokio::test]
async fn test_observer_late_join_sees_full_stream() {
    let provider = Arc::new(
        ScriptedProvider::new(&["one", " two", " three", " four"])
            .with_delay(Duration::from_millis(50)),
    );
    let orchestrator = orchestrator(provider, 10).await;

    let mut started = orchestrator
        .start_stream(&student("alice"), request("s-watch"))
        .await
        .unwrap();

    let mut primary = Vec::new();
    for _ in 0..2 {
        primary.push(started.events.recv().await.unwrap());
    }

    let handle = orchestrator
        .observe(&supervisor("sam"), "s-watch")
        .unwrap();
    assert!(handle.history().len() >= 2);
    assert_eq!(handle.first_sequence(), 0);

    let observed: Vec<ObserverMessage> = handle.into_stream().collect().await;
    primary.extend(drain(&mut started.events).await);

    let mirrored: Vec<StreamEvent> = observed
        .iter()
        .filter_map(|m| match m {
            ObserverMessage::Event(event) => Some(event.clone()),
            _ => None,
        })
        .collect();

    assert!(matches!(
        observed.first(),
        Some(ObserverMessage::HistoryStart { first_sequence: 0, .. })
    ));
    assert!(observed
        .iter()
        .any(|m| matches!(m, ObserverMessage::HistoryEnd { .. })));
    assert_eq!(mirrored, primary);
    assert_eq!(mirrored.last().unwrap().kind, EventKind::Complete);

    started.task.await.unwrap();
}

#[tokio::test]
async fn test_observe_requires_supervisor() {
    let provider = Arc::new(ScriptedProvider::new(&["x"]).hanging());
    let orchestrator = orchestrator(provider, 10).await;

    let started = orchestrator
        .start_stream(&student("alice"), request("s-private"))
        .await
        .unwrap();

    let err = orchestrator
        .observe(&student("mallory"), "s-private")
        .unwrap_err();
    assert!(matches!(err, GatewayError::Forbidden(_)));

    let err = orchestrator
        .observe(&supervisor("sam"), "s-unknown")
        .unwrap_err();
    match err {
        GatewayError::SessionNotActive { available, .. } => {
            assert_eq!(available, vec!["s-private".to_string()]);
        }
        other => panic!("unexpected error: {other:?}"),
    }

    drop(started.events);
    started.task.await.unwrap();
}

#[tokio::test]
async fn test_session_visible_to_owner_and_supervisor_only() {
    let provider = Arc::new(ScriptedProvider::new(&["x"]));
    let orchestrator = orchestrator(provider, 10).await;

    let mut started = orchestrator
        .start_stream(&student("alice"), request("s-mine"))
        .await
        .unwrap();
    drain(&mut started.events).await;
    started.task.await.unwrap();

    assert!(orchestrator
        .session(&student("alice"), "s-mine")
        .await
        .is_ok());
    assert!(orchestrator
        .session(&supervisor("sam"), "s-mine")
        .await
        .is_ok());
    assert!(matches!(
        orchestrator.session(&student("bob"), "s-mine").await,
        Err(GatewayError::SessionNotFound(_))
    ));
}
