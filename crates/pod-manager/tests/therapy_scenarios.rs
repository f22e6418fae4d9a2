//! End-to-end therapy scenarios driven against the scripted exchange
//! provider, mirroring the literal sequences a real pod conversation walks
//! through: pairing from scratch, a bolus that runs to completion, a bolus
//! canceled mid-delivery, and a temp basal replaced mid-flight.

use std::sync::Arc;
use std::time::Duration;

use pod_common::config::PollingConfig;
use pod_common::Units;
use pod_manager::testing::{InMemoryRepository, ScriptedExchangeProvider, ScriptedResponse};
use pod_manager::{
    BasalState, BolusState, PodManager, PodProgress, PodState, PodStatus, RequestBody, RequestSource,
};

fn status(progress: PodProgress) -> PodStatus {
    PodStatus {
        progress,
        basal_state: BasalState::Scheduled,
        bolus_state: BolusState::Inactive,
        alert_mask: 0,
        delivered_insulin: Units::ZERO,
        not_delivered_insulin: Units::ZERO,
        reservoir: Units::from_decimal(150.0).unwrap(),
        message_sequence: 0,
    }
}

fn make_manager(script: Vec<ScriptedResponse>) -> (Arc<PodManager>, Arc<ScriptedExchangeProvider>, Arc<InMemoryRepository>) {
    let repo = Arc::new(InMemoryRepository::new());
    let provider = Arc::new(ScriptedExchangeProvider::new(script));
    let pod = PodState::new(0x1234_5678).with_identity(11111, 22222);
    let manager = Arc::new(PodManager::new(pod, provider.clone(), repo.clone()));
    (manager, provider, repo)
}

/// Same as `make_manager`, but with millisecond-scale poll delays so the
/// wait-and-poll loops in `bolus`/`activate`/`inject_and_start` settle in a
/// few milliseconds of real wall-clock time instead of the production
/// second-scale pacing.
fn make_manager_fast(script: Vec<ScriptedResponse>) -> (Arc<PodManager>, Arc<ScriptedExchangeProvider>, Arc<InMemoryRepository>) {
    let repo = Arc::new(InMemoryRepository::new());
    let provider = Arc::new(ScriptedExchangeProvider::new(script));
    let pod = PodState::new(0x1234_5678).with_identity(11111, 22222);
    let polling = PollingConfig {
        purge_prime_fixed_delay_ms: 1,
        purge_prime_ms_per_tick: 1,
        bolus_fixed_delay_ms: 20,
        bolus_ms_per_tick: 20,
    };
    let manager = Arc::new(PodManager::with_config(pod, provider.clone(), repo.clone(), polling));
    (manager, provider, repo)
}

#[tokio::test]
async fn pair_from_scratch_issues_two_exchanges_with_sequence_override_on_the_second() {
    let script = vec![
        ScriptedResponse::status(status(PodProgress::TankFillCompleted)),
        ScriptedResponse::status(status(PodProgress::PairingSuccess)),
    ];
    let (manager, provider, _repo) = make_manager(script);

    let mut conversation = manager.start_conversation(0, RequestSource::User).await.unwrap();
    manager.pair(&mut conversation, 0).await;

    assert!(!conversation.is_terminal(), "{:?}", conversation.exception);

    let sent = provider.sent_requests().await;
    assert_eq!(sent.len(), 2);
    assert!(matches!(sent[0].body, RequestBody::AssignAddress { .. }));
    assert!(matches!(sent[1].body, RequestBody::SetupPod { .. }));

    let params = provider.sent_parameters().await;
    assert_eq!(params[1].message_sequence_override, Some(1));

    let pod = manager.snapshot().await;
    assert!(pod.activation_date.is_some());
}

#[tokio::test]
async fn pair_fails_when_pod_is_not_yet_filled() {
    let script = vec![ScriptedResponse::status(status(PodProgress::TankPowerActivated))];
    let (manager, provider, _repo) = make_manager(script);

    let mut conversation = manager.start_conversation(0, RequestSource::User).await.unwrap();
    manager.pair(&mut conversation, 0).await;

    assert!(conversation.is_terminal());
    assert_eq!(provider.sent_requests().await.len(), 1);
}

#[tokio::test]
async fn bolus_wait_for_finish_polls_until_not_delivered_reaches_zero() {
    let running = |not_delivered: f64, bolus_state: BolusState| PodStatus {
        bolus_state,
        not_delivered_insulin: Units::from_decimal(not_delivered).unwrap(),
        ..status(PodProgress::Running)
    };
    let script = vec![
        ScriptedResponse::status(running(0.0, BolusState::Inactive)),
        ScriptedResponse::status(running(0.50, BolusState::Immediate)),
        ScriptedResponse::status(running(0.30, BolusState::Immediate)),
        ScriptedResponse::status(running(0.10, BolusState::Immediate)),
        ScriptedResponse::status(running(0.0, BolusState::Inactive)),
    ];
    let (manager, provider, repo) = make_manager_fast(script);

    let mut conversation = manager.start_conversation(0, RequestSource::User).await.unwrap();
    manager
        .bolus(&mut conversation, Units::from_decimal(0.50).unwrap(), true)
        .await;

    assert!(!conversation.is_terminal(), "{:?}", conversation.exception);
    assert_eq!(provider.remaining().await, 0);
    assert_eq!(repo.saved_count().await, 5);
}

#[tokio::test]
async fn bolus_cancel_during_wait_issues_cancel_bolus_and_marks_canceled() {
    let script = vec![
        ScriptedResponse::status(PodStatus {
            bolus_state: BolusState::Inactive,
            ..status(PodProgress::Running)
        }),
        ScriptedResponse::status(PodStatus {
            bolus_state: BolusState::Immediate,
            not_delivered_insulin: Units::from_decimal(0.50).unwrap(),
            ..status(PodProgress::Running)
        }),
        ScriptedResponse::status(PodStatus {
            bolus_state: BolusState::Inactive,
            ..status(PodProgress::Running)
        }),
    ];
    // A generous first-delay (10 ticks * 20ms/tick + 20ms = 220ms) so the
    // cancellation below lands comfortably inside the wait, not after it.
    let (manager, provider, _repo) = make_manager_fast(script);

    let mut conversation = manager.start_conversation(0, RequestSource::User).await.unwrap();
    let token = conversation.cancellation_token.clone();

    let manager2 = manager.clone();
    let handle = tokio::spawn(async move {
        manager2
            .bolus(&mut conversation, Units::from_decimal(0.50).unwrap(), true)
            .await;
        conversation
    });

    // Give the spawned task time to run the preamble, issue the bolus
    // request, and settle into the cancellable sleep before we cancel.
    tokio::time::sleep(Duration::from_millis(30)).await;
    token.cancel();

    let conversation = handle.await.unwrap();
    assert!(conversation.canceled, "{:?}", conversation.exception);
    assert!(!conversation.cancel_failed);

    let sent = provider.sent_requests().await;
    assert!(matches!(sent.last().unwrap().body, RequestBody::CancelBolus));
}

#[tokio::test]
async fn set_temp_basal_replaces_an_active_temp_basal() {
    let script = vec![
        ScriptedResponse::status(PodStatus {
            basal_state: BasalState::Temporary,
            ..status(PodProgress::Running)
        }),
        ScriptedResponse::status(PodStatus {
            basal_state: BasalState::Scheduled,
            ..status(PodProgress::Running)
        }),
        ScriptedResponse::status(PodStatus {
            basal_state: BasalState::Temporary,
            ..status(PodProgress::Running)
        }),
    ];
    let (manager, provider, _repo) = make_manager(script);

    let mut conversation = manager.start_conversation(0, RequestSource::User).await.unwrap();
    manager
        .set_temp_basal(&mut conversation, Units::from_decimal(0.8).unwrap(), 1.0)
        .await;

    assert!(!conversation.is_terminal(), "{:?}", conversation.exception);
    let sent = provider.sent_requests().await;
    assert!(matches!(sent[1].body, RequestBody::CancelTempBasal));
    assert!(matches!(sent[2].body, RequestBody::TempBasal { .. }));

    let pod = manager.snapshot().await;
    assert!(pod.last_temp_basal_result.is_some());
}

#[tokio::test]
async fn set_basal_schedule_rejects_invalid_length_before_any_exchange() {
    let (manager, provider, repo) = make_manager(vec![]);

    let mut conversation = manager.start_conversation(0, RequestSource::User).await.unwrap();
    let schedule = vec![Units::from_decimal(0.5).unwrap(); 47];
    manager.set_basal_schedule(&mut conversation, schedule, 0).await;

    assert!(conversation.is_terminal());
    assert_eq!(provider.sent_requests().await.len(), 0);
    assert_eq!(repo.saved_count().await, 0);
}

#[tokio::test]
async fn nonce_resync_failure_after_retry_is_reported_as_protocol_error() {
    let stuck = PodStatus {
        progress: PodProgress::PairingSuccess,
        ..status(PodProgress::PairingSuccess)
    };
    let script = vec![
        ScriptedResponse::nonce_sync(stuck.clone(), 1),
        ScriptedResponse::nonce_sync(stuck, 2),
    ];
    let (manager, provider, repo) = make_manager(script);

    let mut conversation = manager.start_conversation(0, RequestSource::User).await.unwrap();
    manager.update_status(&mut conversation).await;

    assert!(conversation.is_terminal());
    assert_eq!(provider.remaining().await, 0);
    assert_eq!(repo.saved_count().await, 1, "one persisted result for the whole exchange, retry included");

    let pod = manager.snapshot().await;
    assert!(
        pod.runtime_variables.nonce_sync.is_none(),
        "nonce_sync must be cleared even when the retry permanently fails"
    );
}
