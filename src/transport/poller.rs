//! Long-polling event listener for one bridge session.
//!
//! Pulls batches of [`TransportEvent`]s from the sidecar and forwards them to
//! the session's channel. Network errors are retried with capped exponential
//! backoff. The poller stops after forwarding a `close` event, when the
//! receiver is dropped, or when the session's cancellation token fires.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::TransportEvent;

/// First reconnect delay after a poll error.
const INITIAL_BACKOFF: Duration = Duration::from_millis(1000);

/// Pause after a non-200 poll response.
const NON_SUCCESS_PAUSE: Duration = Duration::from_secs(5);

/// Poller tuning.
#[derive(Debug, Clone)]
pub(crate) struct PollerSettings {
    /// Long-poll request timeout.
    pub timeout: Duration,
    /// Ceiling for the reconnect backoff.
    pub max_backoff: Duration,
}

/// Why a poll loop ended.
enum PollEnd {
    /// A close event was forwarded or the receiver went away.
    Finished,
    /// Transient failure; retry after backoff.
    Error(reqwest::Error),
}

/// Spawn the poller as a background task.
pub(crate) fn spawn_event_poller(
    poll_url: String,
    settings: PollerSettings,
    event_tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            debug!(url = %poll_url, "polling bridge events");
            let outcome = tokio::select! {
                outcome = poll_events(&poll_url, &settings, &event_tx) => outcome,
                () = cancel.cancelled() => break,
            };

            match outcome {
                PollEnd::Finished => break,
                PollEnd::Error(e) => {
                    warn!(
                        error = %e,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        "bridge event poll failed, retrying"
                    );
                    tokio::select! {
                        () = tokio::time::sleep(backoff) => {}
                        () = cancel.cancelled() => break,
                    }
                    backoff = backoff.saturating_mul(2).min(settings.max_backoff);
                }
            }
        }
        info!(url = %poll_url, "bridge event poller stopped");
    })
}

async fn poll_events(
    poll_url: &str,
    settings: &PollerSettings,
    event_tx: &mpsc::Sender<TransportEvent>,
) -> PollEnd {
    let client = match reqwest::Client::builder().timeout(settings.timeout).build() {
        Ok(client) => client,
        Err(e) => return PollEnd::Error(e),
    };

    loop {
        match client.get(poll_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let events = match resp.json::<Vec<TransportEvent>>().await {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(error = %e, "unreadable bridge event batch, skipping");
                        continue;
                    }
                };
                for event in events {
                    debug!(?event, "bridge event received");
                    let closes = matches!(event, TransportEvent::Close { .. });
                    if event_tx.send(event).await.is_err() || closes {
                        return PollEnd::Finished;
                    }
                }
            }
            Ok(resp) => {
                debug!(status = %resp.status(), "event poll returned non-200");
                tokio::time::sleep(NON_SUCCESS_PAUSE).await;
            }
            Err(e) if e.is_timeout() => {
                // Long-poll window elapsed with no events.
                continue;
            }
            Err(e) => return PollEnd::Error(e),
        }
    }
}
