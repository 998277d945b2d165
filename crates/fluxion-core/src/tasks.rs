// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Background work owned by the recorder: periodic loops and fire-and-forget
//! side updates

use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

// ============= Scheduled Task =============

/// Periodic loop on its own tokio task
///
/// The first run happens one period after spawning. A run that overlaps the
/// next tick delays it instead of bursting. Errors from a run are logged and
/// the loop keeps going. [`stop`](Self::stop) lets a run in progress finish;
/// dropping the handle aborts the loop outright.
#[derive(Debug)]
pub struct ScheduledTask {
    name: String,
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                // Checked only between runs, never inside one
                tokio::select! {
                    biased;
                    _ = stop_rx.changed() => break,
                    _ = interval.tick() => {}
                }
                debug!(task = %task_name, "Scheduled task tick");
                if let Err(e) = body().await {
                    error!(task = %task_name, error = %e, "Scheduled task failed");
                }
            }
            debug!(task = %task_name, "Scheduled task stopped");
        });

        Self {
            name,
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// End the loop, letting a run in progress complete. A run still going
    /// after `grace` is aborted.
    pub async fn stop(mut self, grace: Duration) {
        let _ = self.stop_tx.send(true);
        let Some(mut handle) = self.handle.take() else {
            return;
        };

        match tokio::time::timeout(grace, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = %self.name, error = %e, "Scheduled task ended abnormally"),
            Err(_) => {
                warn!(task = %self.name, ?grace, "Scheduled task run overran shutdown, aborting");
                handle.abort();
            }
        }
    }

    /// Abort the loop, abandoning a run in progress
    pub fn cancel(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(JoinHandle::is_finished)
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

// ============= Detached Side Updates =============

#[derive(Debug, Default)]
struct DetachedState {
    closed: bool,
    in_flight: usize,
}

/// Tracker for fire-and-forget updates
///
/// Failures are logged and counted, never propagated. Once closed no new work
/// is accepted, and [`wait_idle`](Self::wait_idle) lets shutdown drain what
/// is still running.
#[derive(Debug, Default)]
pub struct DetachedTasks {
    state: Mutex<DetachedState>,
    failures: AtomicU64,
    idle: Notify,
}

impl DetachedTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` in the background. Returns false if the tracker is closed.
    pub fn spawn<Fut>(self: &Arc<Self>, label: &'static str, work: Fut) -> bool
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.in_flight += 1;
        }

        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = work.await {
                tracker.failures.fetch_add(1, Ordering::Relaxed);
                warn!(task = label, error = %e, "Detached update failed");
            }

            let now_idle = {
                let mut state = tracker.state.lock();
                state.in_flight -= 1;
                state.in_flight == 0
            };
            if now_idle {
                tracker.idle.notify_waiters();
            }
        });
        true
    }

    /// Refuse further work
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Resolve once nothing is in flight
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.state.lock().in_flight == 0 {
                return;
            }
            notified.await;
        }
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}
