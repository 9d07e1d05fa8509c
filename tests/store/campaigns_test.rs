//! Tests for campaign rows: conditional transitions, scheduling, cascade.

use chrono::Utc;

use courier::store::campaigns::{self, CampaignStatus};
use courier::store::recipients::{self, AttemptOutcome};
use courier::store::send_log;

use crate::support;

#[tokio::test]
async fn transition_only_moves_from_listed_states() {
    let db = support::memory_db().await;
    let id = campaigns::insert(
        &db,
        &support::campaign("t-1", vec![support::text_step(1, "hi", 0)], &["62001"]),
    )
    .await
    .expect("insert");

    assert!(campaigns::transition(&db, id, &[CampaignStatus::Draft], CampaignStatus::Running)
        .await
        .expect("first"));
    assert!(!campaigns::transition(&db, id, &[CampaignStatus::Draft], CampaignStatus::Running)
        .await
        .expect("second"));
    assert!(!campaigns::transition(&db, id, &[], CampaignStatus::Paused)
        .await
        .expect("empty from"));

    let campaign = campaigns::require(&db, id).await.expect("campaign");
    assert_eq!(campaign.status, CampaignStatus::Running);
    let started = campaign.started_at.clone().expect("stamped");

    assert!(campaigns::transition(&db, id, &[CampaignStatus::Running], CampaignStatus::Paused)
        .await
        .expect("pause"));
    assert!(campaigns::transition(&db, id, &[CampaignStatus::Paused], CampaignStatus::Running)
        .await
        .expect("resume"));
    assert_eq!(
        campaigns::require(&db, id)
            .await
            .expect("campaign")
            .started_at,
        Some(started),
        "started_at keeps the first start"
    );

    assert!(matches!(
        campaigns::require(&db, 9_999).await,
        Err(courier::store::StoreError::CampaignNotFound(9_999))
    ));
}

#[tokio::test]
async fn due_drafts_respects_schedule_and_status() {
    let db = support::memory_db().await;
    let now = Utc::now();
    let scheduled = |offset_minutes: i64| {
        let mut c = support::campaign("t-2", vec![support::text_step(1, "hi", 0)], &["62001"]);
        c.scheduled_at = now.checked_add_signed(chrono::Duration::minutes(offset_minutes));
        c
    };
    let early = campaigns::insert(&db, &scheduled(-30)).await.expect("insert");
    let recent = campaigns::insert(&db, &scheduled(-1)).await.expect("insert");
    let future = campaigns::insert(&db, &scheduled(60)).await.expect("insert");
    let started = campaigns::insert(&db, &scheduled(-10)).await.expect("insert");
    assert!(campaigns::transition(&db, started, &[CampaignStatus::Draft], CampaignStatus::Running)
        .await
        .expect("transition"));

    let due = campaigns::due_drafts(&db, now).await.expect("due");
    assert_eq!(due, vec![early, recent]);
    assert!(!due.contains(&future));
}

#[tokio::test]
async fn delete_removes_steps_recipients_and_logs() {
    let db = support::memory_db().await;
    let id = campaigns::insert(
        &db,
        &support::campaign("t-3", vec![support::text_step(1, "hi", 0)], &["62001"]),
    )
    .await
    .expect("insert");
    let step = campaigns::steps(&db, id).await.expect("steps")[0].clone();
    let recipient = recipients::list(&db, id).await.expect("list")[0].clone();
    recipients::record_attempt(
        &db,
        &recipient,
        step.id,
        &AttemptOutcome::Sent {
            next_step_after_hours: None,
        },
    )
    .await
    .expect("record");

    assert!(campaigns::delete(&db, id).await.expect("delete"));

    assert!(campaigns::get(&db, id).await.expect("get").is_none());
    assert!(campaigns::steps(&db, id).await.expect("steps").is_empty());
    assert!(recipients::get(&db, recipient.id)
        .await
        .expect("get")
        .is_none());
    assert!(send_log::for_campaign(&db, id).await.expect("logs").is_empty());
    assert!(!campaigns::delete(&db, id).await.expect("delete again"));
}

#[tokio::test]
async fn steps_come_back_in_order() {
    let db = support::memory_db().await;
    let id = campaigns::insert(
        &db,
        &support::campaign(
            "t-4",
            vec![
                support::text_step(3, "third", 0),
                support::text_step(1, "first", 2),
                support::text_step(2, "second", 1),
            ],
            &["62001"],
        ),
    )
    .await
    .expect("insert");

    let texts: Vec<_> = campaigns::steps(&db, id)
        .await
        .expect("steps")
        .into_iter()
        .map(|s| (s.step_order, s.message_text, s.delay_after_hours))
        .collect();
    assert_eq!(
        texts,
        vec![
            (1, "first".to_owned(), 2),
            (2, "second".to_owned(), 1),
            (3, "third".to_owned(), 0),
        ]
    );
}
