//! Periodic background jobs: safety-net scans and lock cleanup.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Owns the engine's timers. Every job is aborted on [`Scheduler::shutdown`]
/// or drop; a job that is mid-run is abandoned at its next await point.
#[derive(Default)]
pub struct Scheduler {
    jobs: Vec<(String, JoinHandle<()>)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `job` every `period`, first after one full period.
    ///
    /// A zero period disables the job and returns `false`. Runs never
    /// overlap; a run that overshoots delays the next tick instead of
    /// bunching them.
    pub fn spawn_every<F, Fut>(&mut self, name: &str, period: Duration, mut job: F) -> bool
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if period.is_zero() {
            debug!("Periodic job {} disabled", name);
            return false;
        }

        let label = name.to_string();
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                debug!("Running periodic job {}", label);
                job().await;
            }
        });
        info!("Scheduled {} every {:?}", name, period);
        self.jobs.push((name.to_string(), handle));
        true
    }

    /// Names of the scheduled jobs.
    pub fn job_names(&self) -> Vec<&str> {
        self.jobs.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Abort every job. Idempotent.
    pub fn shutdown(&mut self) {
        for (name, handle) in self.jobs.drain(..) {
            handle.abort();
            debug!("Stopped periodic job {}", name);
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
