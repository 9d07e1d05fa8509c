//! Tests for the campaign supervisor tick.

use std::time::Duration;

use chrono::Utc;
use sqlx::SqlitePool;
use tokio::sync::watch;

use courier::dispatcher::supervisor::{self, TickReport};
use courier::dispatcher::CampaignDispatcher;
use courier::store::campaigns::{self, CampaignStatus};
use courier::store::recipients;

use crate::support::{self, WAIT};

async fn connected(tenant: &str) -> (SqlitePool, CampaignDispatcher) {
    let db = support::memory_db().await;
    let (manager, _connector) = support::connected_manager(&db, tenant).await;
    let dispatcher = CampaignDispatcher::new(db.clone(), manager);
    (db, dispatcher)
}

async fn status_of(db: &SqlitePool, id: i64) -> CampaignStatus {
    campaigns::status(db, id)
        .await
        .expect("query")
        .expect("campaign exists")
}

#[tokio::test]
async fn due_scheduled_draft_is_started() {
    let (db, dispatcher) = connected("sup-1").await;
    let mut due = support::campaign("sup-1", vec![support::text_step(1, "hi", 0)], &["62001"]);
    due.scheduled_at = Utc::now().checked_sub_signed(chrono::Duration::minutes(5));
    let due = campaigns::insert(&db, &due).await.expect("insert");

    let mut later = support::campaign("sup-1", vec![support::text_step(1, "hi", 0)], &["62001"]);
    later.scheduled_at = Utc::now().checked_add_signed(chrono::Duration::hours(2));
    let later = campaigns::insert(&db, &later).await.expect("insert");

    let unscheduled = campaigns::insert(
        &db,
        &support::campaign("sup-1", vec![support::text_step(1, "hi", 0)], &["62001"]),
    )
    .await
    .expect("insert");

    let report = supervisor::tick(&dispatcher).await.expect("tick");
    assert_eq!(
        report,
        TickReport {
            started: vec![due],
            relaunched: Vec::new(),
        }
    );
    tokio::time::timeout(WAIT, dispatcher.wait(due))
        .await
        .expect("loop finishes");

    assert_eq!(status_of(&db, due).await, CampaignStatus::Completed);
    assert_eq!(status_of(&db, later).await, CampaignStatus::Draft);
    assert_eq!(status_of(&db, unscheduled).await, CampaignStatus::Draft);
}

#[tokio::test]
async fn running_campaign_is_relaunched_once_its_gate_opens() {
    let (db, dispatcher) = connected("sup-2").await;
    let id = campaigns::insert(
        &db,
        &support::campaign(
            "sup-2",
            vec![
                support::text_step(1, "first", 24),
                support::text_step(2, "second", 0),
            ],
            &["62001", "62002"],
        ),
    )
    .await
    .expect("insert");
    dispatcher.start(id).await.expect("start");
    tokio::time::timeout(WAIT, dispatcher.wait(id))
        .await
        .expect("first pass finishes");

    // Gate still closed: nothing to relaunch.
    let report = supervisor::tick(&dispatcher).await.expect("tick");
    assert!(report.relaunched.is_empty());

    sqlx::query(
        "UPDATE campaign_recipients SET next_send_at = datetime('now', '-1 hours') \
         WHERE campaign_id = ?1",
    )
    .bind(id)
    .execute(&db)
    .await
    .expect("open the gate");

    let report = supervisor::tick(&dispatcher).await.expect("tick");
    assert_eq!(report.relaunched, vec![id]);
    tokio::time::timeout(WAIT, dispatcher.wait(id))
        .await
        .expect("second pass finishes");

    assert_eq!(status_of(&db, id).await, CampaignStatus::Completed);
    for r in recipients::list(&db, id).await.expect("list") {
        assert_eq!(r.current_step, 2);
    }
}

#[tokio::test]
async fn quota_exhausted_campaign_is_left_alone() {
    let (db, dispatcher) = connected("sup-3").await;
    let mut definition = support::campaign(
        "sup-3",
        vec![support::text_step(1, "hi", 0)],
        &["62001", "62002", "62003"],
    );
    definition.daily_limit = 1;
    let id = campaigns::insert(&db, &definition).await.expect("insert");
    dispatcher.start(id).await.expect("start");
    tokio::time::timeout(WAIT, dispatcher.wait(id))
        .await
        .expect("loop finishes");

    let report = supervisor::tick(&dispatcher).await.expect("tick");
    assert!(report.relaunched.is_empty());
    assert_eq!(status_of(&db, id).await, CampaignStatus::Running);
}

#[tokio::test]
async fn supervisor_loop_exits_on_shutdown() {
    let (_db, dispatcher) = connected("sup-4").await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(supervisor::run_supervisor(
        dispatcher,
        Duration::from_millis(20),
        shutdown_rx,
    ));

    tokio::time::sleep(Duration::from_millis(60)).await;
    shutdown_tx.send(true).expect("supervisor listening");

    tokio::time::timeout(WAIT, task)
        .await
        .expect("supervisor stops")
        .expect("no panic");
}
