//! Wall-clock trigger for routine refreshes and saves.
//!
//! The intervals are read from the recommender on every tick, so
//! `set_update_interval`/`set_save_interval` take effect without a restart.
//! A zero interval disables that trigger.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::recommender::Recommender;

pub fn spawn_periodic(recommender: Arc<Recommender>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let tick = recommender.config().schedule.tick.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_update = Instant::now();
        let mut last_save = Instant::now();

        tracing::debug!(
            recommender = %recommender.name(),
            tick_ms = tick.as_millis() as u64,
            "Periodic trigger started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if is_due(last_update, recommender.update_interval()) {
                last_update = Instant::now();
                match recommender.update_now().await {
                    Ok(handle) => {
                        tracing::debug!(job_id = %handle.id(), kind = %handle.kind(), "Scheduled periodic update");
                    }
                    Err(e) => {
                        tracing::warn!(recommender = %recommender.name(), error = %e, "Failed to schedule periodic update");
                    }
                }
            }

            if recommender.has_model_path()
                && is_due(last_save, recommender.save_interval())
                && recommender.is_ready().await
            {
                last_save = Instant::now();
                match recommender.persist_now().await {
                    Ok(handle) => {
                        tracing::debug!(job_id = %handle.id(), kind = %handle.kind(), "Scheduled periodic save");
                    }
                    Err(e) => {
                        tracing::warn!(recommender = %recommender.name(), error = %e, "Failed to schedule periodic save");
                    }
                }
            }
        }

        tracing::debug!(recommender = %recommender.name(), "Periodic trigger stopped");
    })
}

fn is_due(last: Instant, interval: Duration) -> bool {
    !interval.is_zero() && last.elapsed() >= interval
}
