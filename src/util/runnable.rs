use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Notify;

/// Calls `runnable.run_once()` every `interval` until `shutdown` is notified.
///
/// The first run is delayed by up to a tenth of the interval so replicas
/// started together do not all tick at once. A shutdown notification that
/// arrives mid-run abandons that run.
pub(crate) async fn run_at_fixed_interval<T: PeriodicRunnable + ?Sized>(
    runnable: Arc<T>,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    let jitter = startup_jitter(interval);
    tokio::select! {
        _ = shutdown.notified() => {
            runnable.before_shutdown_complete().await;
            return;
        }
        _ = tokio::time::sleep(jitter) => {}
    }

    let mut last_loop_time = Instant::now();
    loop {
        let mut shutdown_signal = false;
        tokio::select! {
            _ = shutdown.notified() => { shutdown_signal = true }
            _ = runnable.run_once() => {}
        }

        if !shutdown_signal && Instant::now() - last_loop_time < interval {
            tokio::select! {
                _ = shutdown.notified() => { shutdown_signal = true }
                _ = tokio::time::sleep(last_loop_time + interval - Instant::now()) => {}
            }
        }
        last_loop_time = Instant::now();

        if shutdown_signal {
            break;
        }
    }

    runnable.before_shutdown_complete().await;
}

fn startup_jitter(interval: Duration) -> Duration {
    let max_millis = (interval.as_millis() / 10) as u64;
    if max_millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_millis))
}

#[async_trait]
pub(crate) trait PeriodicRunnable: Send + Sync {
    async fn run_once(&self);
    async fn before_shutdown_complete(&self) {}
}
