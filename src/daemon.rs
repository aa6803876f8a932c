//! Periodic job scheduler.
//!
//! Every registered [`Job`] runs in its own task: sleep for the job's current
//! interval or until cancellation, fire the handler once, repeat. A job that
//! is still running when it fires again is skipped, never queued. Handler
//! panics are logged and re-raised out of [`DaemonScheduler::run`], which
//! cancels every other job first.

use crate::error::Result;
use crate::persistence::ChainStore;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &JobContext) -> Result<()>;
}

/// Per-job handle passed to every handler invocation.
pub struct JobContext {
    cancel: CancellationToken,
    interval: Mutex<Duration>,
}

impl JobContext {
    pub fn new(cancel: CancellationToken, interval: Duration) -> Self {
        Self {
            cancel,
            interval: Mutex::new(interval),
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn interval(&self) -> Duration {
        *self.interval.lock()
    }

    /// Changes the sleep before the next firing.
    pub fn set_interval(&self, interval: Duration) {
        *self.interval.lock() = interval;
    }

    /// Sleeps unless cancelled first. Returns false on cancellation.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Running,
    Stopped,
}

#[derive(Debug)]
pub enum FireOutcome {
    Ran(Result<()>),
    /// The previous invocation was still running.
    Skipped,
}

pub struct JobMetrics {
    pub registry: Registry,
    pub duration: HistogramVec,
    pub runs: IntCounterVec,
    pub skipped: IntCounterVec,
    pub failures: IntCounterVec,
}

impl JobMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let duration = register_histogram_vec_with_registry!(
            HistogramOpts::new("kernelchain_job_duration_seconds", "Time spent in one job run")
                .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
            &["job"],
            registry
        )?;
        let runs = register_int_counter_vec_with_registry!(
            Opts::new("kernelchain_job_runs_total", "Job handler invocations"),
            &["job"],
            registry
        )?;
        let skipped = register_int_counter_vec_with_registry!(
            Opts::new(
                "kernelchain_job_skipped_total",
                "Firings skipped because the job was still running"
            ),
            &["job"],
            registry
        )?;
        let failures = register_int_counter_vec_with_registry!(
            Opts::new("kernelchain_job_failures_total", "Job runs that returned an error"),
            &["job"],
            registry
        )?;

        Ok(Self {
            registry,
            duration,
            runs,
            skipped,
            failures,
        })
    }
}

struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// A job plus its re-entrancy flag and state.
pub struct JobRunner {
    job: Arc<dyn Job>,
    busy: AtomicBool,
    state: RwLock<JobState>,
    metrics: Arc<JobMetrics>,
}

impl JobRunner {
    pub fn new(job: Arc<dyn Job>, metrics: Arc<JobMetrics>) -> Self {
        Self {
            job,
            busy: AtomicBool::new(false),
            state: RwLock::new(JobState::Idle),
            metrics,
        }
    }

    pub fn name(&self) -> &'static str {
        self.job.name()
    }

    pub fn state(&self) -> JobState {
        *self.state.read()
    }

    fn set_state(&self, state: JobState) {
        let mut current = self.state.write();
        if *current != JobState::Stopped {
            *current = state;
        }
    }

    /// Runs the handler once unless it is already running.
    pub async fn fire(&self, ctx: &JobContext) -> FireOutcome {
        let name = self.name();
        if self
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(job = name, "previous run still in progress, skipping");
            self.metrics.skipped.with_label_values(&[name]).inc();
            return FireOutcome::Skipped;
        }
        let _busy = BusyGuard(&self.busy);

        self.set_state(JobState::Running);
        self.metrics.runs.with_label_values(&[name]).inc();
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.job.run(ctx)).catch_unwind().await;
        self.metrics
            .duration
            .with_label_values(&[name])
            .observe(started.elapsed().as_secs_f64());
        self.set_state(JobState::Idle);

        match outcome {
            Ok(Ok(())) => FireOutcome::Ran(Ok(())),
            Ok(Err(e)) if e.is_expected() => {
                debug!(job = name, reason = %e, "nothing to do");
                FireOutcome::Ran(Ok(()))
            }
            Ok(Err(e)) => {
                error!(job = name, error = %e, "job failed");
                self.metrics.failures.with_label_values(&[name]).inc();
                FireOutcome::Ran(Err(e))
            }
            Err(panic) => {
                error!(job = name, "job panicked");
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn run_loop(self: Arc<Self>, ctx: JobContext, done: mpsc::UnboundedSender<&'static str>) {
        let name = self.name();
        info!(job = name, interval = ?ctx.interval(), "job started");
        loop {
            if !ctx.sleep(ctx.interval()).await {
                break;
            }
            self.fire(&ctx).await;
        }
        *self.state.write() = JobState::Stopped;
        info!(job = name, "job stopped");
        let _ = done.send(name);
    }
}

pub struct DaemonScheduler {
    store: Arc<dyn ChainStore>,
    cancel: CancellationToken,
    install_poll: Duration,
    metrics: Arc<JobMetrics>,
    jobs: Vec<(Arc<JobRunner>, Duration)>,
}

impl DaemonScheduler {
    pub fn new(
        store: Arc<dyn ChainStore>,
        cancel: CancellationToken,
        install_poll: Duration,
    ) -> Result<Self> {
        Ok(Self {
            store,
            cancel,
            install_poll,
            metrics: Arc::new(JobMetrics::new()?),
            jobs: Vec::new(),
        })
    }

    pub fn register(&mut self, job: Arc<dyn Job>, interval: Duration) -> Arc<JobRunner> {
        let runner = Arc::new(JobRunner::new(job, self.metrics.clone()));
        self.jobs.push((runner.clone(), interval));
        runner
    }

    pub fn runner(&self, name: &str) -> Option<Arc<JobRunner>> {
        self.jobs
            .iter()
            .find(|(r, _)| r.name() == name)
            .map(|(r, _)| r.clone())
    }

    pub fn states(&self) -> HashMap<&'static str, JobState> {
        self.jobs.iter().map(|(r, _)| (r.name(), r.state())).collect()
    }

    pub fn metrics(&self) -> Arc<JobMetrics> {
        self.metrics.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Polls the installation marker. Returns false if cancelled first.
    pub async fn wait_for_install(&self) -> Result<bool> {
        let mut logged = false;
        loop {
            if self.store.is_installed()? {
                return Ok(true);
            }
            if !logged {
                info!("waiting for installation to complete");
                logged = true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.install_poll) => {}
            }
        }
    }

    /// Runs every job until cancellation and returns the names of the jobs
    /// in the order they stopped.
    pub async fn run(self) -> Result<Vec<&'static str>> {
        if !self.wait_for_install().await? {
            warn!("cancelled before installation completed");
            return Ok(Vec::new());
        }

        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let mut tasks = JoinSet::new();
        for (runner, interval) in &self.jobs {
            let ctx = JobContext::new(self.cancel.child_token(), *interval);
            tasks.spawn(runner.clone().run_loop(ctx, done_tx.clone()));
        }
        drop(done_tx);

        let mut stopped = Vec::with_capacity(self.jobs.len());
        loop {
            tokio::select! {
                name = done_rx.recv() => match name {
                    Some(name) => stopped.push(name),
                    None => break,
                },
                Some(joined) = tasks.join_next() => self.check_joined(joined),
            }
        }
        while let Some(joined) = tasks.join_next().await {
            self.check_joined(joined);
        }
        Ok(stopped)
    }

    /// A panicked job takes the whole scheduler down with it. Dropping the
    /// join set on the way out aborts the remaining jobs.
    fn check_joined(&self, joined: std::result::Result<(), JoinError>) {
        if let Err(e) = joined {
            if e.is_panic() {
                error!("job task panicked, stopping every job");
                self.cancel.cancel();
                std::panic::resume_unwind(e.into_panic());
            }
        }
    }
}

/// Cancels `cancel` on ctrl-c or SIGTERM.
pub fn spawn_signal_handler(cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
                        _ = term.recv() => info!("received SIGTERM"),
                        _ = cancel.cancelled() => return,
                    }
                }
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable");
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
                        _ = cancel.cancelled() => return,
                    }
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
                _ = cancel.cancelled() => return,
            }
        }
        cancel.cancel();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChainError;
    use crate::persistence::MemoryStore;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        runs: AtomicUsize,
        fail_with: Option<ChainError>,
    }

    #[async_trait]
    impl Job for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        async fn run(&self, ctx: &JobContext) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            ctx.set_interval(Duration::from_millis(5));
            match &self.fail_with {
                Some(e) => Err(e.clone()),
                None => Ok(()),
            }
        }
    }

    fn counter(fail_with: Option<ChainError>) -> Arc<Counter> {
        Arc::new(Counter {
            runs: AtomicUsize::new(0),
            fail_with,
        })
    }

    #[tokio::test]
    async fn test_expected_error_counts_as_success() {
        let job = counter(Some(ChainError::NotMyTurn("slot taken".to_string())));
        let runner = JobRunner::new(job.clone(), Arc::new(JobMetrics::new().unwrap()));
        let ctx = JobContext::new(CancellationToken::new(), Duration::from_secs(1));

        assert!(matches!(runner.fire(&ctx).await, FireOutcome::Ran(Ok(()))));
        assert_eq!(ctx.interval(), Duration::from_millis(5));
        assert_eq!(runner.state(), JobState::Idle);
        assert_eq!(runner.metrics.failures.with_label_values(&["counter"]).get(), 0);
    }

    #[tokio::test]
    async fn test_failure_recorded() {
        let job = counter(Some(ChainError::NetworkError("refused".to_string())));
        let runner = JobRunner::new(job, Arc::new(JobMetrics::new().unwrap()));
        let ctx = JobContext::new(CancellationToken::new(), Duration::from_secs(1));
        assert!(matches!(runner.fire(&ctx).await, FireOutcome::Ran(Err(_))));
        assert_eq!(runner.metrics.failures.with_label_values(&["counter"]).get(), 1);
        assert_eq!(runner.metrics.runs.with_label_values(&["counter"]).get(), 1);
    }

    #[tokio::test]
    async fn test_scheduler_waits_for_install_then_stops_on_cancel() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let store = Arc::new(MemoryStore::new());
            let cancel = CancellationToken::new();
            let mut scheduler =
                DaemonScheduler::new(store.clone(), cancel.clone(), Duration::from_millis(5))
                    .unwrap();
            let job = counter(None);
            let runner = scheduler.register(job.clone(), Duration::from_millis(5));

            let handle = tokio::spawn(scheduler.run());
            tokio::time::sleep(Duration::from_millis(30)).await;
            assert_eq!(job.runs.load(Ordering::SeqCst), 0);

            store.set_installed().unwrap();
            while job.runs.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            cancel.cancel();

            let stopped = handle.await.unwrap().unwrap();
            assert_eq!(stopped, vec!["counter"]);
            assert_eq!(runner.state(), JobState::Stopped);
        })
        .await
        .expect("scheduler test timed out");
    }

    #[tokio::test]
    async fn test_cancel_before_install_returns_nothing() {
        let cancel = CancellationToken::new();
        let scheduler = DaemonScheduler::new(
            Arc::new(MemoryStore::new()),
            cancel.clone(),
            Duration::from_millis(5),
        )
        .unwrap();
        cancel.cancel();
        assert!(scheduler.run().await.unwrap().is_empty());
    }
}
