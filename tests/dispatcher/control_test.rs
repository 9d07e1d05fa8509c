//! Tests for dispatcher control operations: start, pause, resume, requeue.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use courier::dispatcher::{CampaignDispatcher, DispatchError, LaunchOutcome, NO_STEPS_REASON};
use courier::store::campaigns::{self, CampaignStatus};
use courier::store::recipients::{self, RecipientStatus};
use courier::store::send_log::{self, LogStatus};

use crate::support::{self, eventually, FakeConnector, WAIT};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn connected(tenant: &str) -> (SqlitePool, Arc<FakeConnector>, CampaignDispatcher) {
    let db = support::memory_db().await;
    let (manager, connector) = support::connected_manager(&db, tenant).await;
    let dispatcher = CampaignDispatcher::new(db.clone(), manager);
    (db, connector, dispatcher)
}

/// A five-recipient campaign slow enough to interrupt.
async fn slow_campaign(db: &SqlitePool, tenant: &str) -> i64 {
    let mut definition = support::campaign(
        tenant,
        vec![support::text_step(1, "hello", 0)],
        &["62001", "62002", "62003", "62004", "62005"],
    );
    definition.min_delay_ms = 250;
    definition.max_delay_ms = 250;
    campaigns::insert(db, &definition).await.expect("insert")
}

async fn status_of(db: &SqlitePool, id: i64) -> CampaignStatus {
    campaigns::status(db, id)
        .await
        .expect("query")
        .expect("campaign exists")
}

async fn finish(dispatcher: &CampaignDispatcher, id: i64) {
    tokio::time::timeout(WAIT, dispatcher.wait(id))
        .await
        .expect("loop finishes");
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_is_idempotent_while_the_loop_lives() {
    let (db, _connector, dispatcher) = connected("ctl-1").await;
    let id = slow_campaign(&db, "ctl-1").await;

    assert_eq!(dispatcher.start(id).await.expect("start"), LaunchOutcome::Launched);
    assert_eq!(
        dispatcher.start(id).await.expect("start again"),
        LaunchOutcome::AlreadyRunning
    );
    assert_eq!(
        dispatcher.resume(id).await.expect("resume running"),
        LaunchOutcome::AlreadyRunning
    );
    assert_eq!(dispatcher.active_ids().await, vec![id]);

    dispatcher.pause(id).await.expect("pause");
    finish(&dispatcher, id).await;
}

#[tokio::test]
async fn concurrent_starts_launch_one_loop() {
    let (db, connector, dispatcher) = connected("ctl-2").await;
    let id = slow_campaign(&db, "ctl-2").await;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let dispatcher = dispatcher.clone();
        tasks.spawn(async move { dispatcher.start(id).await });
    }
    let mut launched = 0_u32;
    while let Some(joined) = tasks.join_next().await {
        if joined.expect("task").expect("start") == LaunchOutcome::Launched {
            launched = launched.saturating_add(1);
        }
    }
    assert_eq!(launched, 1);

    finish(&dispatcher, id).await;
    // Every recipient got exactly one message.
    for phone in ["62001", "62002", "62003", "62004", "62005"] {
        assert_eq!(connector.sent_to(phone).len(), 1, "{phone}");
    }
}

#[tokio::test]
async fn pause_stops_at_the_next_recipient_and_resume_continues() {
    let (db, connector, dispatcher) = connected("ctl-3").await;
    let id = slow_campaign(&db, "ctl-3").await;

    dispatcher.start(id).await.expect("start");
    let probe = Arc::clone(&connector);
    assert!(
        eventually(WAIT, || {
            let probe = Arc::clone(&probe);
            async move { !probe.sent().is_empty() }
        })
        .await
    );
    dispatcher.pause(id).await.expect("pause");
    finish(&dispatcher, id).await;

    assert_eq!(status_of(&db, id).await, CampaignStatus::Paused);
    let sent_at_pause = connector.sent().len();
    assert!(sent_at_pause < 5, "paused before the end");
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(connector.sent().len(), sent_at_pause, "no sends while paused");

    // Pausing again is a no-op.
    dispatcher.pause(id).await.expect("pause again");

    assert_eq!(dispatcher.resume(id).await.expect("resume"), LaunchOutcome::Launched);
    finish(&dispatcher, id).await;

    assert_eq!(status_of(&db, id).await, CampaignStatus::Completed);
    assert_eq!(connector.sent().len(), 5);
    for phone in ["62001", "62002", "62003", "62004", "62005"] {
        assert_eq!(connector.sent_to(phone).len(), 1, "{phone}");
    }
}

#[tokio::test]
async fn zero_step_campaign_fails_on_start() {
    let (db, connector, dispatcher) = connected("ctl-4").await;
    let id = campaigns::insert(&db, &support::campaign("ctl-4", Vec::new(), &["62001"]))
        .await
        .expect("insert");

    let err = dispatcher.start(id).await.expect_err("no steps");
    assert!(matches!(err, DispatchError::NoSteps(i) if i == id));

    let campaign = campaigns::require(&db, id).await.expect("campaign");
    assert_eq!(campaign.status, CampaignStatus::Failed);
    assert_eq!(campaign.failure_reason.as_deref(), Some(NO_STEPS_REASON));
    assert!(connector.sent().is_empty());
    assert!(!dispatcher.is_active(id).await);
}

#[tokio::test]
async fn actions_are_gated_by_status() {
    let (db, _connector, dispatcher) = connected("ctl-5").await;
    let id = slow_campaign(&db, "ctl-5").await;

    let err = dispatcher.pause(id).await.expect_err("draft cannot pause");
    assert!(matches!(
        err,
        DispatchError::InvalidState {
            action: "pause",
            status: CampaignStatus::Draft,
            ..
        }
    ));
    let err = dispatcher.resume(id).await.expect_err("draft cannot resume");
    assert!(matches!(err, DispatchError::InvalidState { action: "resume", .. }));

    assert!(campaigns::transition(&db, id, &[CampaignStatus::Draft], CampaignStatus::Completed)
        .await
        .expect("transition"));
    let err = dispatcher.start(id).await.expect_err("completed cannot start");
    assert!(matches!(
        err,
        DispatchError::InvalidState {
            status: CampaignStatus::Completed,
            ..
        }
    ));

    assert!(matches!(
        dispatcher.start(9_999).await,
        Err(DispatchError::NotFound(9_999))
    ));
    assert!(matches!(
        dispatcher.pause(9_999).await,
        Err(DispatchError::NotFound(9_999))
    ));
}

#[tokio::test]
async fn activate_marks_running_without_a_loop() {
    let (db, connector, dispatcher) = connected("ctl-6").await;
    let id = slow_campaign(&db, "ctl-6").await;

    dispatcher.activate(id, false).await.expect("activate");

    assert_eq!(status_of(&db, id).await, CampaignStatus::Running);
    assert!(!dispatcher.is_active(id).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(connector.sent().is_empty());

    // Resuming a draft is rejected even through activate.
    let other = slow_campaign(&db, "ctl-6").await;
    assert!(dispatcher.activate(other, true).await.is_err());
}

#[tokio::test]
async fn requeue_reopens_a_completed_campaign() {
    let (db, connector, dispatcher) = connected("ctl-7").await;
    connector.fail_sends_to("62002", "temporarily unavailable");
    let id = campaigns::insert(
        &db,
        &support::campaign(
            "ctl-7",
            vec![support::text_step(1, "hello", 0)],
            &["62001", "62002"],
        ),
    )
    .await
    .expect("insert");

    dispatcher.start(id).await.expect("start");
    finish(&dispatcher, id).await;
    assert_eq!(status_of(&db, id).await, CampaignStatus::Completed);

    assert_eq!(dispatcher.requeue_failed(id).await.expect("requeue"), 1);
    assert_eq!(status_of(&db, id).await, CampaignStatus::Paused);
    let counts = recipients::status_counts(&db, id).await.expect("counts");
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.failed, 0);

    // Nothing failed now: requeue is a no-op.
    assert_eq!(dispatcher.requeue_failed(id).await.expect("requeue"), 0);

    dispatcher.resume(id).await.expect("resume");
    finish(&dispatcher, id).await;

    // The retry failed again; both attempts are in the log.
    assert_eq!(
        send_log::count(&db, id, LogStatus::Failed).await.expect("count"),
        2
    );
    assert_eq!(connector.sent_to("62001").len(), 1, "sent recipient untouched");
    let failed: Vec<_> = recipients::list(&db, id)
        .await
        .expect("list")
        .into_iter()
        .filter(|r| r.status == RecipientStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);

    assert!(matches!(
        dispatcher.requeue_failed(9_999).await,
        Err(DispatchError::NotFound(9_999))
    ));
}

#[tokio::test]
async fn shutdown_stops_loops_but_keeps_running_status() {
    let (db, _connector, dispatcher) = connected("ctl-8").await;
    let id = slow_campaign(&db, "ctl-8").await;
    dispatcher.start(id).await.expect("start");

    tokio::time::timeout(WAIT, dispatcher.shutdown())
        .await
        .expect("shutdown completes");

    assert!(dispatcher.active_ids().await.is_empty());
    assert_eq!(status_of(&db, id).await, CampaignStatus::Running);
}
