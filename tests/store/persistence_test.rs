//! Tests that state written to an on-disk store survives a reopen.

use courier::connection::ConnectionStatus;
use courier::store::campaigns::{self, CampaignStatus};
use courier::store::connections::{self, StatusUpdate};
use courier::store::{self, recipients};

use crate::support;

#[tokio::test]
async fn connections_and_campaigns_survive_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("courier.db");
    std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");

    let db = store::open(&path).await.expect("open");
    connections::save_credentials(&db, "desk-1", "blob-1")
        .await
        .expect("credentials");
    connections::upsert_status(&db, "desk-1", ConnectionStatus::Connected, StatusUpdate::default())
        .await
        .expect("status");
    let id = campaigns::insert(
        &db,
        &support::campaign(
            "desk-1",
            vec![support::text_step(1, "hi", 0)],
            &["62001", "62002"],
        ),
    )
    .await
    .expect("insert");
    assert!(campaigns::transition(&db, id, &[CampaignStatus::Draft], CampaignStatus::Running)
        .await
        .expect("transition"));
    db.close().await;

    let db = store::open(&path).await.expect("reopen");
    assert_eq!(
        connections::load_credentials(&db, "desk-1")
            .await
            .expect("load"),
        Some("blob-1".to_owned())
    );
    assert_eq!(
        connections::resumable(&db).await.expect("resumable"),
        vec!["desk-1".to_owned()]
    );
    assert_eq!(
        campaigns::ids_with_status(&db, CampaignStatus::Running)
            .await
            .expect("running"),
        vec![id]
    );
    assert_eq!(recipients::list(&db, id).await.expect("list").len(), 2);
    db.close().await;
}

#[tokio::test]
async fn logged_out_rows_are_not_resumable() {
    let db = support::memory_db().await;
    connections::save_credentials(&db, "gone", "blob")
        .await
        .expect("credentials");
    connections::upsert_status(&db, "gone", ConnectionStatus::LoggedOut, StatusUpdate::default())
        .await
        .expect("status");
    connections::upsert_status(&db, "fresh", ConnectionStatus::QrReady, StatusUpdate {
        qr: Some("qr"),
        pairing_code: None,
    })
    .await
    .expect("status");

    assert!(connections::resumable(&db).await.expect("query").is_empty());

    assert!(connections::delete(&db, "gone").await.expect("delete"));
    assert!(!connections::delete(&db, "gone").await.expect("delete again"));
    let remaining: Vec<_> = connections::list(&db)
        .await
        .expect("list")
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(remaining, vec!["fresh".to_owned()]);
}

#[tokio::test]
async fn credentials_are_not_serialized() {
    let db = support::memory_db().await;
    connections::save_credentials(&db, "desk-2", "top-secret-blob")
        .await
        .expect("credentials");
    let record = connections::get(&db, "desk-2")
        .await
        .expect("query")
        .expect("row");
    let json = serde_json::to_string(&record).expect("serialize");
    assert!(!json.contains("top-secret-blob"));
    assert!(json.contains("desk-2"));
}
