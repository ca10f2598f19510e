//! Periodic health sweep.
//!
//! Every interval the monitor asks the host to reload modules whose pool has
//! fewer healthy, recently used instances than half its size. See
//! [`ModuleHost::check_health`].

use std::sync::Weak;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::host::ModuleHost;

pub(crate) fn spawn(
    host: Weak<ModuleHost>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    info!(interval_secs = interval.as_secs(), "Health monitor started");

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let Some(host) = host.upgrade() else { break };
                    let reloaded = host.check_health(interval).await;
                    if !reloaded.is_empty() {
                        debug!(modules = ?reloaded, "Health check triggered reloads");
                    }
                }
            }
        }

        debug!("Health monitor stopped");
    })
}
