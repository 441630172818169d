//! Scheduler execution loop.
//!
//! Polls the task store on a fixed tick and fires whatever is due. The
//! fire itself is just an engine submit; execution tracking is entirely
//! the engine's business.

use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use super::Scheduler;

/// Run the scheduler loop until the process exits.
pub async fn run_scheduler_loop(scheduler: Scheduler, tick: Duration) {
    info!(tick_secs = tick.as_secs(), "scheduler engine started");

    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        match scheduler.fire_due(Utc::now()).await {
            Ok(0) => {}
            Ok(fired) => info!(fired, "scheduled tasks submitted"),
            Err(e) => error!("failed to fire due tasks: {}", e),
        }
    }
}
