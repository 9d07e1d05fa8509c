//! Tests for recipient selection and attempt recording.

use chrono::Utc;
use sqlx::SqlitePool;

use courier::store::campaigns;
use courier::store::recipients::{self, AttemptOutcome, RecipientStatus};
use courier::store::send_log::{self, LogStatus};

use crate::support;

async fn two_step_campaign(db: &SqlitePool, phones: &[&str]) -> i64 {
    campaigns::insert(
        db,
        &support::campaign(
            "r-1",
            vec![
                support::text_step(1, "one", 6),
                support::text_step(2, "two", 0),
            ],
            phones,
        ),
    )
    .await
    .expect("insert")
}

#[tokio::test]
async fn eligible_batch_is_ordered_and_limited() {
    let db = support::memory_db().await;
    let id = two_step_campaign(&db, &["62003", "62001", "62002"]).await;

    let batch = recipients::eligible_batch(&db, id, 2, Utc::now(), 2)
        .await
        .expect("batch");
    let phones: Vec<_> = batch.iter().map(|r| r.phone_number.as_str()).collect();
    assert_eq!(phones, vec!["62003", "62001"], "creation order, limited");
}

#[tokio::test]
async fn sent_step_is_gated_until_its_delay_passes() {
    let db = support::memory_db().await;
    let id = two_step_campaign(&db, &["62001"]).await;
    let step = campaigns::steps(&db, id).await.expect("steps")[0].clone();
    let recipient = recipients::list(&db, id).await.expect("list")[0].clone();

    recipients::mark_sending(&db, recipient.id).await.expect("mark");
    recipients::record_attempt(
        &db,
        &recipient,
        step.id,
        &AttemptOutcome::Sent {
            next_step_after_hours: Some(6),
        },
    )
    .await
    .expect("record");

    let now = Utc::now();
    assert!(!recipients::has_eligible(&db, id, 2, now).await.expect("query"));
    assert_eq!(recipients::outstanding(&db, id, 2).await.expect("query"), 1);

    let later = now
        .checked_add_signed(chrono::Duration::hours(7))
        .expect("in range");
    let batch = recipients::eligible_batch(&db, id, 2, later, 10)
        .await
        .expect("batch");
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].current_step, 1);
    assert_eq!(batch[0].status, RecipientStatus::Sent);

    // With every step sent the recipient is finished.
    recipients::record_attempt(
        &db,
        &batch[0],
        step.id,
        &AttemptOutcome::Sent {
            next_step_after_hours: None,
        },
    )
    .await
    .expect("record");
    assert!(!recipients::has_eligible(&db, id, 2, later).await.expect("query"));
    assert_eq!(recipients::outstanding(&db, id, 2).await.expect("query"), 0);
}

#[tokio::test]
async fn failed_attempt_is_logged_with_its_error() {
    let db = support::memory_db().await;
    let id = two_step_campaign(&db, &["62001", "62002"]).await;
    let step = campaigns::steps(&db, id).await.expect("steps")[0].clone();
    let recipient = recipients::list(&db, id).await.expect("list")[1].clone();

    recipients::record_attempt(
        &db,
        &recipient,
        step.id,
        &AttemptOutcome::Failed {
            error: "rejected: not on network".to_owned(),
        },
    )
    .await
    .expect("record");

    let stored = recipients::get(&db, recipient.id)
        .await
        .expect("get")
        .expect("exists");
    assert_eq!(stored.status, RecipientStatus::Failed);
    assert_eq!(stored.current_step, 0);
    assert_eq!(stored.error_message.as_deref(), Some("rejected: not on network"));

    let logs = send_log::for_recipient(&db, recipient.id)
        .await
        .expect("logs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].status, LogStatus::Failed);
    assert_eq!(logs[0].step_id, Some(step.id));
    assert_eq!(
        logs[0].error_message.as_deref(),
        Some("rejected: not on network")
    );

    // Failed recipients are neither eligible nor outstanding.
    let batch = recipients::eligible_batch(&db, id, 2, Utc::now(), 10)
        .await
        .expect("batch");
    assert_eq!(batch.len(), 1);
    assert_eq!(recipients::outstanding(&db, id, 2).await.expect("query"), 1);

    assert_eq!(recipients::requeue_failed(&db, id).await.expect("requeue"), 1);
    let counts = recipients::status_counts(&db, id).await.expect("counts");
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.total(), 2);
}

#[tokio::test]
async fn sent_logs_count_towards_today() {
    let db = support::memory_db().await;
    let id = two_step_campaign(&db, &["62001", "62002"]).await;
    let step = campaigns::steps(&db, id).await.expect("steps")[0].clone();
    for recipient in recipients::list(&db, id).await.expect("list") {
        recipients::record_attempt(
            &db,
            &recipient,
            step.id,
            &AttemptOutcome::Sent {
                next_step_after_hours: Some(6),
            },
        )
        .await
        .expect("record");
    }

    let hour_ago = Utc::now()
        .checked_sub_signed(chrono::Duration::hours(1))
        .expect("in range");
    assert_eq!(
        send_log::count_since(&db, id, LogStatus::Sent, hour_ago)
            .await
            .expect("count"),
        2
    );
    let tomorrow = Utc::now()
        .checked_add_signed(chrono::Duration::days(1))
        .expect("in range");
    assert_eq!(
        send_log::count_since(&db, id, LogStatus::Sent, tomorrow)
            .await
            .expect("count"),
        0
    );
    assert_eq!(
        courier::dispatcher::remaining_today(&db, id, 5, "UTC", Utc::now())
            .await
            .expect("remaining"),
        3
    );
}
