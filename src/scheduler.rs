use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::config::{EngineConfig, RetryConfig};
use crate::cycle::{last_closed_period, run_rank_cycle, run_scarcity_cycle};
use crate::error::Result;
use crate::store::{EventLog, SnapshotStore};

/// Delay before retry number `attempt` (1-based): doubles each time, capped.
pub fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    Duration::from_millis(
        retry
            .base_delay_ms
            .saturating_mul(factor)
            .min(retry.max_delay_ms),
    )
}

/// Retries transient failures with exponential backoff. Anything else is returned at once.
pub async fn retry_with_backoff<T, F, Fut>(
    retry: &RetryConfig,
    label: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < retry.max_attempts => {
                let delay = backoff_delay(retry, attempt);
                warn!(
                    label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Runs scarcity and rank cycles on their cadences until ctrl-c.
pub async fn run_schedule<S>(store: Arc<S>, config: Arc<EngineConfig>) -> Result<()>
where
    S: EventLog + SnapshotStore + 'static,
{
    let mut scarcity_tick = tokio::time::interval(Duration::from_secs(
        config.schedule.scarcity_interval_minutes.max(1) * 60,
    ));
    let mut rank_tick = tokio::time::interval(Duration::from_secs(
        config.schedule.rank_interval_hours.max(1) * 3600,
    ));
    scarcity_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    rank_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        scarcity_minutes = config.schedule.scarcity_interval_minutes,
        rank_hours = config.schedule.rank_interval_hours,
        "scheduler started"
    );

    loop {
        tokio::select! {
            _ = scarcity_tick.tick() => {
                if let Err(err) = run_scarcity_cycle(Arc::clone(&store), &config, Utc::now()).await {
                    error!(error = %err, "scarcity cycle failed; previous snapshot stays published");
                }
            }
            _ = rank_tick.tick() => {
                let period = last_closed_period(Utc::now().date_naive(), config.rank_cadence);
                match run_rank_cycle(Arc::clone(&store), Arc::clone(&config), period).await {
                    Ok(summary) if summary.is_clean() => {
                        info!(%period, scopes = summary.published.len(), "rank cycle done");
                    }
                    Ok(summary) => {
                        warn!(%period, failed = summary.failed.len(), "rank cycle partially failed");
                    }
                    Err(err) => error!(%period, error = %err, "rank cycle failed"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("scheduler stopping");
                return Ok(());
            }
        }
    }
}
