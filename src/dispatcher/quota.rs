//! Daily send quota, counted from local midnight in the campaign's timezone.

use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use sqlx::SqlitePool;
use tracing::warn;

use crate::store::send_log::{self, LogStatus};
use crate::store::StoreError;

/// Parse an IANA timezone name, falling back to UTC.
pub fn resolve_timezone(name: &str) -> Tz {
    name.parse::<Tz>().unwrap_or_else(|_| {
        warn!(timezone = name, "unknown timezone, using UTC for daily quota");
        Tz::UTC
    })
}

/// Start of the local day containing `now`, expressed in UTC.
pub fn local_midnight(now: DateTime<Utc>, tz: Tz) -> DateTime<Utc> {
    let local_date = now.with_timezone(&tz).date_naive();
    let midnight = local_date.and_time(NaiveTime::MIN);
    // A DST gap at midnight has no local 00:00; take the earliest valid
    // instant, and fall back to UTC midnight if none resolves.
    tz.from_local_datetime(&midnight)
        .earliest()
        .map_or_else(|| midnight.and_utc(), |dt| dt.with_timezone(&Utc))
}

/// Sends still allowed today.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on SQLite failure.
pub async fn remaining_today(
    db: &SqlitePool,
    campaign_id: i64,
    daily_limit: u32,
    timezone: &str,
    now: DateTime<Utc>,
) -> Result<u32, StoreError> {
    let since = local_midnight(now, resolve_timezone(timezone));
    let sent = send_log::count_since(db, campaign_id, LogStatus::Sent, since).await?;
    let sent = u32::try_from(sent).unwrap_or(u32::MAX);
    Ok(daily_limit.saturating_sub(sent))
}
