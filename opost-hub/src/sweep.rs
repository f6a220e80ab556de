//! Background maintenance sweeps
//!
//! One interval task runs code expiry and task escalation back to back, so
//! the two sweeps never overlap and expiry is always observed before
//! escalation within a tick. Missed ticks are skipped, not bunched.

use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error};

use crate::dispatch::TaskDispatcher;
use crate::lifecycle::CodeLifecycle;
use crate::util::retry_on_lock;

pub fn spawn_sweeps(
    lifecycle: CodeLifecycle,
    dispatcher: TaskDispatcher,
    interval_secs: u64,
    max_lock_wait_ms: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;

            let expiry = retry_on_lock("expiry sweep", max_lock_wait_ms, || {
                lifecycle.expiry_sweep()
            })
            .await;
            match expiry {
                Ok(0) => {}
                Ok(n) => debug!(expired = n, "expiry sweep retired codes"),
                Err(e) => error!(error = %e, "expiry sweep failed"),
            }

            let escalation = retry_on_lock("escalation sweep", max_lock_wait_ms, || {
                dispatcher.escalation_sweep()
            })
            .await;
            match escalation {
                Ok(stats) if stats.escalated + stats.failed + stats.released > 0 => {
                    debug!(
                        escalated = stats.escalated,
                        failed = stats.failed,
                        released = stats.released,
                        "escalation sweep"
                    );
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "escalation sweep failed"),
            }
        }
    })
}
