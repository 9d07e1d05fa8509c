//! Connection rows: status, pairing artifacts, and the opaque credential blob.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::trace;

use crate::connection::ConnectionStatus;

use super::{to_u32, StoreError};

/// Row type returned by SQLite queries for connections.
type ConnectionRow = (
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    i64,
    String,
);

const SELECT_COLUMNS: &str = "SELECT id, status, credential_blob, phone_number, current_qr, \
     current_pairing_code, profile_picture_url, reconnect_attempts, updated_at \
     FROM connections";

/// Persisted state of one tenant's connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    /// Tenant identity.
    pub id: String,
    /// Last persisted status.
    pub status: ConnectionStatus,
    /// Opaque credentials emitted by the transport.
    #[serde(skip_serializing)]
    pub credential_blob: Option<String>,
    /// Phone number of the linked account, once connected.
    pub phone_number: Option<String>,
    /// QR payload while in `qr_ready`.
    pub current_qr: Option<String>,
    /// Numeric pairing code while in `pairing`.
    pub current_pairing_code: Option<String>,
    /// Profile picture of the linked account, if known.
    pub profile_picture_url: Option<String>,
    /// Consecutive reconnect attempts since the last successful open.
    pub reconnect_attempts: u32,
    /// Last update timestamp.
    pub updated_at: String,
}

fn from_row(row: ConnectionRow) -> Result<ConnectionRecord, StoreError> {
    let (
        id,
        status,
        credential_blob,
        phone_number,
        current_qr,
        current_pairing_code,
        profile_picture_url,
        reconnect_attempts,
        updated_at,
    ) = row;
    Ok(ConnectionRecord {
        id,
        status: ConnectionStatus::parse(&status)?,
        credential_blob,
        phone_number,
        current_qr,
        current_pairing_code,
        profile_picture_url,
        reconnect_attempts: to_u32("reconnect_attempts", reconnect_attempts)?,
        updated_at,
    })
}

/// Pairing artifact to persist alongside a status change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusUpdate<'a> {
    /// QR payload (only kept while in `qr_ready`).
    pub qr: Option<&'a str>,
    /// Pairing code (only kept while in `pairing`).
    pub pairing_code: Option<&'a str>,
}

/// Upsert the status of a connection, creating the row if needed.
///
/// The QR code and pairing code columns are overwritten on every call so a
/// stale artifact never outlives the state it belongs to.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn upsert_status(
    db: &SqlitePool,
    tenant_id: &str,
    status: ConnectionStatus,
    update: StatusUpdate<'_>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO connections (id, status, current_qr, current_pairing_code, updated_at) \
         VALUES (?1, ?2, ?3, ?4, datetime('now')) \
         ON CONFLICT(id) DO UPDATE SET status = excluded.status, \
             current_qr = excluded.current_qr, \
             current_pairing_code = excluded.current_pairing_code, \
             updated_at = excluded.updated_at",
    )
    .bind(tenant_id)
    .bind(status.as_str())
    .bind(update.qr)
    .bind(update.pairing_code)
    .execute(db)
    .await?;
    trace!(tenant = tenant_id, status = status.as_str(), "connection status persisted");
    Ok(())
}

/// Persist the credential blob emitted by the transport.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn save_credentials(
    db: &SqlitePool,
    tenant_id: &str,
    blob: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO connections (id, status, credential_blob, updated_at) \
         VALUES (?1, 'connecting', ?2, datetime('now')) \
         ON CONFLICT(id) DO UPDATE SET credential_blob = excluded.credential_blob, \
             updated_at = excluded.updated_at",
    )
    .bind(tenant_id)
    .bind(blob)
    .execute(db)
    .await?;
    trace!(tenant = tenant_id, bytes = blob.len(), "credentials persisted");
    Ok(())
}

/// Load the persisted credential blob, if any.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn load_credentials(
    db: &SqlitePool,
    tenant_id: &str,
) -> Result<Option<String>, StoreError> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT credential_blob FROM connections WHERE id = ?1")
            .bind(tenant_id)
            .fetch_optional(db)
            .await?;
    Ok(row.and_then(|(blob,)| blob))
}

/// Record account details reported when the session opens.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn save_profile(
    db: &SqlitePool,
    tenant_id: &str,
    phone_number: Option<&str>,
    profile_picture_url: Option<&str>,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE connections SET phone_number = COALESCE(?1, phone_number), \
             profile_picture_url = COALESCE(?2, profile_picture_url), \
             updated_at = datetime('now') \
         WHERE id = ?3",
    )
    .bind(phone_number)
    .bind(profile_picture_url)
    .bind(tenant_id)
    .execute(db)
    .await?;
    Ok(())
}

/// Persist the reconnect attempt counter.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn set_reconnect_attempts(
    db: &SqlitePool,
    tenant_id: &str,
    attempts: u32,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE connections SET reconnect_attempts = ?1, updated_at = datetime('now') \
         WHERE id = ?2",
    )
    .bind(i64::from(attempts))
    .bind(tenant_id)
    .execute(db)
    .await?;
    Ok(())
}

/// Fetch one connection row.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn get(db: &SqlitePool, tenant_id: &str) -> Result<Option<ConnectionRecord>, StoreError> {
    let row: Option<ConnectionRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
        .bind(tenant_id)
        .fetch_optional(db)
        .await?;
    row.map(from_row).transpose()
}

/// List every connection row ordered by tenant id.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn list(db: &SqlitePool) -> Result<Vec<ConnectionRecord>, StoreError> {
    let rows: Vec<ConnectionRow> = sqlx::query_as(&format!("{SELECT_COLUMNS} ORDER BY id ASC"))
        .fetch_all(db)
        .await?;
    rows.into_iter().map(from_row).collect()
}

/// Tenants whose credentials are stored and can be resumed without pairing.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn resumable(db: &SqlitePool) -> Result<Vec<String>, StoreError> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT id FROM connections \
         WHERE credential_blob IS NOT NULL AND status != 'logged_out' \
         ORDER BY id ASC",
    )
    .fetch_all(db)
    .await?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Delete a connection row and its credentials.
///
/// Returns `true` if a row was removed.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn delete(db: &SqlitePool, tenant_id: &str) -> Result<bool, StoreError> {
    let result = sqlx::query("DELETE FROM connections WHERE id = ?1")
        .bind(tenant_id)
        .execute(db)
        .await?;
    trace!(tenant = tenant_id, "connection row deleted");
    Ok(result.rows_affected() > 0)
}
