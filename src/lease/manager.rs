use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{sync::Notify, task::JoinHandle};
use tracing::{info, warn};

use super::reaper::Reaper;
use crate::util::runnable::run_at_fixed_interval;

/// Owns the background reaper loop.
pub(crate) struct LeaseManager {
    reaper: Arc<Reaper>,
    interval: Duration,
    shutdown: Arc<Notify>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LeaseManager {
    pub(crate) fn new(reaper: Arc<Reaper>, interval: Duration) -> Self {
        Self {
            reaper,
            interval,
            shutdown: Arc::new(Notify::new()),
            handle: Mutex::new(None),
        }
    }

    /// Starts sweeping at a fixed interval. Calling it again is a no-op.
    pub(crate) fn start(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        if handle.is_some() {
            return;
        }
        info!(interval = ?self.interval, "starting lease reaper");
        *handle = Some(tokio::spawn(run_at_fixed_interval(
            self.reaper.clone(),
            self.interval,
            self.shutdown.clone(),
        )));
    }

    pub(crate) fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stops the loop and waits for it to wind down.
    pub(crate) async fn shutdown(&self) {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            // A stored permit means the signal survives even if the loop is
            // between selects right now.
            self.shutdown.notify_one();
            if let Err(e) = handle.await {
                warn!(error = %e, "lease reaper task ended abnormally");
            }
        }
    }
}
