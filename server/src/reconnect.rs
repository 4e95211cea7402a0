//! Keeps a disconnected participant's seat open for a short grace window.

use crate::hub::Hub;
use crate::session::SessionHandle;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Watches for `token` to come back. A returning connection is reattached to
/// the participant; after the last retry the participant is removed, and the
/// session with it if nobody is left.
pub fn spawn_monitor(hub: Arc<Hub>, token: String, session: SessionHandle) -> JoinHandle<()> {
    tokio::spawn(async move {
        let timing = hub.config().timing.clone();
        let mut ticker = interval_at(
            Instant::now() + timing.reconnect_interval,
            timing.reconnect_interval,
        );
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        for attempt in 1..=timing.reconnect_retries {
            ticker.tick().await;
            let Some(connection) = hub.connection(&token).await else {
                debug!("{} not back yet ({}/{})", token, attempt, timing.reconnect_retries);
                continue;
            };
            if connection.is_closed() {
                continue;
            }
            match connection.session_id() {
                Some(current) if current != session.id() => {
                    info!("{} moved to session {}", token, current);
                    break;
                }
                _ => {}
            }

            match session.reattach(connection).await {
                Ok(true) => {
                    info!("{} reconnected to session {}", token, session.id());
                    return;
                }
                // The participant already left for good
                Ok(false) => return,
                Err(e) => {
                    debug!("Reconnect for {} abandoned: {}", token, e);
                    return;
                }
            }
        }

        info!("{} timed out of session {}", token, session.id());
        if let Err(e) = hub.depart(&token, &session).await {
            warn!("Could not evict {}: {}", token, e);
        }
    })
}
