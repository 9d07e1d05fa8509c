//! Tests for `ConnectionManager`: pairing, persistence, logout, registry.

use std::sync::Arc;
use std::time::Duration;

use courier::connection::{ConnectionError, ConnectionStatus};
use courier::store::connections::{self, StatusUpdate};
use courier::transport::TransportEvent;

use crate::support::{self, eventually, FakeConnector, OpenBehavior, WAIT};

#[tokio::test]
async fn qr_pairing_persists_artifact_then_credentials() {
    let db = support::memory_db().await;
    let connector = FakeConnector::new(OpenBehavior::Interactive);
    let manager = support::manager(&db, &connector);

    let handle = manager.get_or_create("desk-1").await.expect("valid tenant");
    handle
        .wait_for(WAIT, |s| s == ConnectionStatus::QrReady)
        .await
        .expect("qr offered");

    let db_check = db.clone();
    assert!(
        eventually(WAIT, || {
            let db = db_check.clone();
            async move {
                connections::get(&db, "desk-1")
                    .await
                    .expect("query")
                    .is_some_and(|r| {
                        r.status == ConnectionStatus::QrReady
                            && r.current_qr.as_deref() == Some("qr-1")
                    })
            }
        })
        .await,
        "qr_ready and the QR payload should be persisted"
    );

    connector
        .emit(
            "desk-1",
            TransportEvent::CredentialsUpdated {
                blob: "paired-blob".to_owned(),
            },
        )
        .await;
    connector
        .emit(
            "desk-1",
            TransportEvent::Open {
                phone_number: Some("628111".to_owned()),
                profile_picture_url: Some("https://pics.test/me.jpg".to_owned()),
            },
        )
        .await;
    handle
        .wait_for(WAIT, |s| s == ConnectionStatus::Connected)
        .await
        .expect("connected");

    let db_check = db.clone();
    assert!(
        eventually(WAIT, || {
            let db = db_check.clone();
            async move {
                connections::get(&db, "desk-1")
                    .await
                    .expect("query")
                    .is_some_and(|r| r.status == ConnectionStatus::Connected && r.phone_number.is_some())
            }
        })
        .await
    );
    let record = connections::get(&db, "desk-1")
        .await
        .expect("query")
        .expect("row exists");
    assert_eq!(record.credential_blob.as_deref(), Some("paired-blob"));
    assert_eq!(record.current_qr, None, "QR is cleared once connected");
    assert_eq!(record.phone_number.as_deref(), Some("628111"));
    assert_eq!(
        record.profile_picture_url.as_deref(),
        Some("https://pics.test/me.jpg")
    );
}

#[tokio::test]
async fn stored_credentials_resume_without_pairing() {
    let db = support::memory_db().await;
    connections::save_credentials(&db, "desk-2", "stored-blob")
        .await
        .expect("seed credentials");
    let connector = FakeConnector::new(OpenBehavior::Interactive);
    let manager = support::manager(&db, &connector);

    let handle = manager.get_or_create("desk-2").await.expect("valid tenant");
    handle
        .wait_for(WAIT, |s| s == ConnectionStatus::Connected)
        .await
        .expect("resumed");

    assert_eq!(
        connector.connect_credentials("desk-2"),
        vec![Some("stored-blob".to_owned())]
    );
}

#[tokio::test]
async fn pairing_code_is_issued_and_persisted() {
    let db = support::memory_db().await;
    let connector = FakeConnector::new(OpenBehavior::Interactive);
    let manager = support::manager(&db, &connector);

    let code = manager
        .request_pairing_code("desk-3", "+62 811-000")
        .await
        .expect("code issued");
    assert_eq!(code, "ABCD-1234");
    assert_eq!(
        manager.status("desk-3").await.expect("status"),
        ConnectionStatus::Pairing
    );

    let record = connections::get(&db, "desk-3")
        .await
        .expect("query")
        .expect("row exists");
    assert_eq!(record.current_pairing_code.as_deref(), Some("ABCD-1234"));
    assert_eq!(record.current_qr, None);
}

#[tokio::test]
async fn pairing_code_needs_digits() {
    let db = support::memory_db().await;
    let connector = FakeConnector::new(OpenBehavior::Interactive);
    let manager = support::manager(&db, &connector);

    let err = manager
        .request_pairing_code("desk-4", "call me")
        .await
        .expect_err("no digits");
    assert!(matches!(err, ConnectionError::InvalidPhone(_)));
    assert_eq!(connector.connect_count("desk-4"), 0);
}

#[tokio::test]
async fn pairing_code_rejected_when_already_connected() {
    let db = support::memory_db().await;
    let (manager, _connector) = support::connected_manager(&db, "desk-5").await;

    let err = manager
        .request_pairing_code("desk-5", "62811")
        .await
        .expect_err("already connected");
    assert!(matches!(err, ConnectionError::AlreadyConnected(_)));
}

#[tokio::test]
async fn concurrent_get_or_create_opens_one_session() {
    let db = support::memory_db().await;
    let connector = FakeConnector::new(OpenBehavior::AutoOpen);
    let manager = support::manager(&db, &connector);

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..16 {
        let manager = Arc::clone(&manager);
        tasks.spawn(async move { manager.get_or_create("desk-6").await });
    }
    let mut handles = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        handles.push(joined.expect("task").expect("valid tenant"));
    }

    handles[0]
        .wait_for(WAIT, |s| s == ConnectionStatus::Connected)
        .await
        .expect("connected");
    assert_eq!(connector.connect_count("desk-6"), 1);
    assert_eq!(manager.snapshot().await.len(), 1);
}

#[tokio::test]
async fn invalid_tenant_ids_are_rejected() {
    let db = support::memory_db().await;
    let connector = FakeConnector::new(OpenBehavior::AutoOpen);
    let manager = support::manager(&db, &connector);

    for bad in ["", "a/b", "has space", "../up"] {
        let err = manager.get_or_create(bad).await.expect_err("invalid");
        assert!(matches!(err, ConnectionError::InvalidTenant(_)), "{bad:?}");
    }
    assert!(connector.sent().is_empty());
}

#[tokio::test]
async fn unknown_tenant_is_uninitialized() {
    let db = support::memory_db().await;
    let connector = FakeConnector::new(OpenBehavior::AutoOpen);
    let manager = support::manager(&db, &connector);

    assert_eq!(
        manager.status("nobody").await.expect("status"),
        ConnectionStatus::Uninitialized
    );
    assert_eq!(manager.attempts("nobody").await, None);
}

#[tokio::test]
async fn status_falls_back_to_persisted_row() {
    let db = support::memory_db().await;
    connections::upsert_status(
        &db,
        "desk-7",
        ConnectionStatus::Disconnected,
        StatusUpdate::default(),
    )
    .await
    .expect("seed");
    let connector = FakeConnector::new(OpenBehavior::AutoOpen);
    let manager = support::manager(&db, &connector);

    assert_eq!(
        manager.status("desk-7").await.expect("status"),
        ConnectionStatus::Disconnected
    );
    assert_eq!(connector.connect_count("desk-7"), 0);
}

#[tokio::test]
async fn disconnect_keeps_credentials_for_resume() {
    let db = support::memory_db().await;
    let (manager, connector) = support::connected_manager(&db, "desk-8").await;

    manager.disconnect("desk-8").await.expect("disconnect");
    assert_eq!(
        manager.status("desk-8").await.expect("status"),
        ConnectionStatus::Disconnected
    );
    let record = connections::get(&db, "desk-8")
        .await
        .expect("query")
        .expect("row kept");
    assert_eq!(record.status, ConnectionStatus::Disconnected);
    assert_eq!(record.credential_blob.as_deref(), Some("creds-desk-8"));

    // No automatic reconnect after an explicit disconnect.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.connect_count("desk-8"), 1);

    let handle = manager.get_or_create("desk-8").await.expect("reopen");
    handle
        .wait_for(WAIT, |s| s == ConnectionStatus::Connected)
        .await
        .expect("connected again");
    assert_eq!(
        connector.connect_credentials("desk-8"),
        vec![None, Some("creds-desk-8".to_owned())]
    );
}

#[tokio::test]
async fn explicit_logout_purges_and_stays_down() {
    let db = support::memory_db().await;
    let (manager, connector) = support::connected_manager(&db, "desk-9").await;

    manager.logout("desk-9").await.expect("logout");

    assert_eq!(connector.logouts(), vec!["desk-9".to_owned()]);
    assert!(connections::get(&db, "desk-9").await.expect("query").is_none());
    assert_eq!(
        manager.status("desk-9").await.expect("status"),
        ConnectionStatus::LoggedOut
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.connect_count("desk-9"), 1, "no reconnect after logout");
}

#[tokio::test]
async fn remote_logout_is_terminal() {
    let db = support::memory_db().await;
    let (manager, connector) = support::connected_manager(&db, "desk-10").await;
    let handle = manager.get_or_create("desk-10").await.expect("live handle");

    connector
        .close("desk-10", courier::connection::CloseReason::LoggedOut)
        .await;
    handle
        .wait_for(WAIT, |s| s == ConnectionStatus::LoggedOut)
        .await
        .expect("logged out");

    let db_check = db.clone();
    assert!(
        eventually(WAIT, || {
            let db = db_check.clone();
            async move { connections::get(&db, "desk-10").await.expect("query").is_none() }
        })
        .await,
        "row is deleted"
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connector.connect_count("desk-10"), 1);
}

#[tokio::test]
async fn restore_all_resumes_only_tenants_with_credentials() {
    let db = support::memory_db().await;
    connections::save_credentials(&db, "desk-a", "blob-a")
        .await
        .expect("seed");
    connections::upsert_status(
        &db,
        "desk-b",
        ConnectionStatus::Disconnected,
        StatusUpdate::default(),
    )
    .await
    .expect("seed");
    let connector = FakeConnector::new(OpenBehavior::Interactive);
    let manager = support::manager(&db, &connector);

    let restored = manager.restore_all().await.expect("restore");
    assert_eq!(restored, 1);
    let handle = manager.get_or_create("desk-a").await.expect("live");
    handle
        .wait_for(WAIT, |s| s == ConnectionStatus::Connected)
        .await
        .expect("resumed");
    assert_eq!(connector.connect_count("desk-b"), 0);

    let snapshot = manager.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].tenant_id, "desk-a");
}

#[tokio::test]
async fn shutdown_stops_every_session() {
    let db = support::memory_db().await;
    let connector = FakeConnector::new(OpenBehavior::AutoOpen);
    let manager = support::manager(&db, &connector);
    for tenant in ["s-1", "s-2"] {
        manager
            .get_or_create(tenant)
            .await
            .expect("valid")
            .wait_for(WAIT, |s| s == ConnectionStatus::Connected)
            .await
            .expect("connected");
    }

    manager.shutdown().await;

    for snap in manager.snapshot().await {
        assert_eq!(snap.status, ConnectionStatus::Disconnected, "{}", snap.tenant_id);
    }
    assert_eq!(
        connections::resumable(&db).await.expect("query"),
        vec!["s-1".to_owned(), "s-2".to_owned()]
    );
}
