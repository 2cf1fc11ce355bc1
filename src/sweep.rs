//! Background sweep tasks.
//!
//! Sweeps are the only time-triggered work in the daemon: expiring mutes and
//! closing quiet incidents. Both are safe to run from any number of workers
//! concurrently - each pass conditions its mutations on the pre-sweep state,
//! so overlapping runs split the work instead of repeating it.

use crate::directives::Directive;
use crate::events::{Dispatcher, unenforce_directive};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Spawn the mute-expiry sweep.
///
/// Every tick lifts all active mutes whose deadline passed and forwards the
/// matching un-enforcement directives to the applier channel.
pub fn spawn_mute_sweep(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    directives: mpsc::Sender<Directive>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);

        loop {
            interval.tick().await;

            match dispatcher.mute.sweep_expired(Utc::now()).await {
                Ok(lifted) => {
                    crate::metrics::record_sweep("mute_expiry", lifted.len());
                    for case in &lifted {
                        if directives.send(unenforce_directive(case)).await.is_err() {
                            info!("applier channel closed, stopping mute sweep");
                            return;
                        }
                    }
                }
                Err(e) => {
                    // Next pass retries; lifting is idempotent.
                    warn!(error = %e, "mute expiry sweep failed");
                }
            }
        }
    });
}

/// Spawn the incident-closure sweep.
///
/// Every tick stamps the terminal close action on incidents that stayed
/// quiet for the configured cooldown, returning their guilds to `Armed`.
pub fn spawn_incident_sweep(dispatcher: Arc<Dispatcher>, interval: Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(interval);

        loop {
            interval.tick().await;

            match dispatcher.antinuke.sweep_closures(Utc::now()).await {
                Ok(closed) => {
                    crate::metrics::record_sweep("incident_closure", closed.len());
                }
                Err(e) => {
                    warn!(error = %e, "incident closure sweep failed");
                }
            }
        }
    });
}
