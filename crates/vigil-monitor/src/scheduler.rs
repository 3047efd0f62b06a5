//! Scan scheduling engine.
//!
//! One coordinating dispatch task owns a due-time-ordered job queue and
//! reacts to commands, due timers, and finished scan tasks. Scans run as
//! independent tasks that first acquire a semaphore permit, so at most
//! `max_concurrent_scans` execute simultaneously while excess jobs queue
//! up behind the permits (backpressure, never rejection).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{sleep_until, timeout, Duration, Instant};

use vigil_core::types::{Device, JobId, NetworkSnapshot, ScanProfile, SnapshotMetadata};
use vigil_core::{Transient, VigilError};

use crate::config::MonitorConfig;
use crate::resilience::RetryPolicy;
use crate::scanner::{ScanError, Scanner};
use crate::target::ScanTarget;

/// Scheduler settings, extracted from the monitor configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_scans: usize,
    pub min_interval: Duration,
    pub scan_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub backoff_multiplier: f64,
    pub shutdown_grace: Duration,
    pub default_profile: ScanProfile,
}

impl From<&MonitorConfig> for SchedulerConfig {
    fn from(cfg: &MonitorConfig) -> Self {
        Self {
            max_concurrent_scans: cfg.max_concurrent_scans,
            min_interval: Duration::from_secs(cfg.min_interval_secs),
            scan_timeout: Duration::from_secs(cfg.scan_timeout_secs),
            max_retries: cfg.max_retries,
            retry_base_delay: Duration::from_millis(cfg.retry_base_delay_ms),
            retry_max_delay: Duration::from_millis(cfg.retry_max_delay_ms),
            backoff_multiplier: cfg.backoff_multiplier,
            shutdown_grace: Duration::from_secs(cfg.shutdown_grace_secs),
            default_profile: cfg.default_profile,
        }
    }
}

impl SchedulerConfig {
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_retries + 1,
            base_delay: self.retry_base_delay,
            backoff_multiplier: self.backoff_multiplier,
            max_delay: self.retry_max_delay,
        }
    }
}

/// Events the scheduler reports to its owner.
#[derive(Debug)]
pub enum SchedulerEvent {
    ScanStarted {
        job_id: JobId,
        target: String,
        profile: ScanProfile,
    },
    SnapshotReady {
        job_id: JobId,
        snapshot: NetworkSnapshot,
    },
    ScanFailed {
        job_id: JobId,
        target: String,
        error: String,
        attempts: u32,
    },
}

#[derive(Clone)]
struct RecurringJob {
    id: JobId,
    target: ScanTarget,
    profile: ScanProfile,
    interval: Duration,
}

struct ManualRequest {
    job_id: JobId,
    target: ScanTarget,
    profile: ScanProfile,
    timeout: Duration,
    reply: oneshot::Sender<Result<NetworkSnapshot, VigilError>>,
}

enum Command {
    Schedule { job: RecurringJob },
    Cancel { job_id: JobId, reply: oneshot::Sender<bool> },
    Manual(ManualRequest),
}

/// Owns recurring registrations and ad hoc manual requests; emits
/// [`SchedulerEvent`]s to the channel supplied at construction.
///
/// A scheduler runs at most once: `start()` spawns the dispatch loop and
/// `stop()` ends it for good. The orchestrator builds a fresh scheduler on
/// every startup.
pub struct Scheduler {
    cfg: SchedulerConfig,
    scanner: Arc<dyn Scanner>,
    events: mpsc::Sender<SchedulerEvent>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: Mutex<Option<mpsc::Receiver<Command>>>,
    shutdown: watch::Sender<bool>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        cfg: SchedulerConfig,
        scanner: Arc<dyn Scanner>,
        events: mpsc::Sender<SchedulerEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (shutdown, _) = watch::channel(false);
        Self {
            cfg,
            scanner,
            events,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
            shutdown,
            dispatch: Mutex::new(None),
        }
    }

    /// Begin the dispatch loop. Fails if it was already started.
    pub fn start(&self) -> Result<(), VigilError> {
        let cmd_rx = lock(&self.cmd_rx)
            .take()
            .ok_or(VigilError::WrongState {
                op: "scheduler start",
                state: "already started".to_string(),
            })?;

        let handle = tokio::spawn(run_dispatch(
            self.cfg.clone(),
            self.scanner.clone(),
            self.events.clone(),
            cmd_rx,
            self.shutdown.subscribe(),
        ));
        *lock(&self.dispatch) = Some(handle);

        tracing::info!(
            max_concurrent = self.cfg.max_concurrent_scans,
            "Scheduler dispatch loop started"
        );
        Ok(())
    }

    /// Whether the dispatch loop is currently running.
    pub fn is_running(&self) -> bool {
        lock(&self.dispatch)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Register a recurring scan. The first run is dispatched immediately,
    /// subsequent runs every `interval`.
    pub fn schedule(
        &self,
        range: &str,
        interval: Duration,
        profile: Option<ScanProfile>,
    ) -> Result<JobId, VigilError> {
        let target = ScanTarget::parse(range)?;
        if interval < self.cfg.min_interval {
            return Err(VigilError::Validation(format!(
                "interval {}s is below the minimum {}s",
                interval.as_secs(),
                self.cfg.min_interval.as_secs()
            )));
        }

        let job = RecurringJob {
            id: JobId::new(),
            target,
            profile: profile.unwrap_or(self.cfg.default_profile),
            interval,
        };
        let id = job.id;
        self.cmd_tx
            .try_send(Command::Schedule { job })
            .map_err(|_| VigilError::Unavailable("scheduler queue unavailable".to_string()))?;
        Ok(id)
    }

    /// Remove a recurring registration. In-flight runs finish; future
    /// occurrences stop. Returns whether the job was found.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, VigilError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Cancel { job_id, reply })
            .await
            .map_err(|_| VigilError::Unavailable("scheduler stopped".to_string()))?;
        rx.await
            .map_err(|_| VigilError::Unavailable("scheduler stopped".to_string()))
    }

    /// Run one scan now, subject to the concurrency ceiling, and wait for
    /// its completion or final failure.
    pub async fn trigger_manual(
        &self,
        range: &str,
        profile: Option<ScanProfile>,
        timeout_override: Option<Duration>,
    ) -> Result<NetworkSnapshot, VigilError> {
        let target = ScanTarget::parse(range)?;
        let (reply, rx) = oneshot::channel();
        let request = ManualRequest {
            job_id: JobId::new(),
            target,
            profile: profile.unwrap_or(self.cfg.default_profile),
            timeout: timeout_override.unwrap_or(self.cfg.scan_timeout),
            reply,
        };

        self.cmd_tx
            .send(Command::Manual(request))
            .await
            .map_err(|_| VigilError::Unavailable("scheduler stopped".to_string()))?;

        rx.await
            .map_err(|_| VigilError::Unavailable("scan abandoned during shutdown".to_string()))?
    }

    /// Halt the dispatch loop. In-flight scans get the configured grace
    /// window to finish or observe cancellation, then are abandoned.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);

        let handle = lock(&self.dispatch).take();
        if let Some(mut handle) = handle {
            let deadline = self.cfg.shutdown_grace + Duration::from_secs(1);
            if timeout(deadline, &mut handle).await.is_err() {
                tracing::warn!("Dispatch loop exceeded shutdown grace, aborting");
                handle.abort();
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The coordinating loop: admits due jobs, handles commands, reaps
/// finished scan tasks.
async fn run_dispatch(
    cfg: SchedulerConfig,
    scanner: Arc<dyn Scanner>,
    events: mpsc::Sender<SchedulerEvent>,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut shutdown: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(cfg.max_concurrent_scans));
    let mut queue: BTreeMap<(Instant, JobId), RecurringJob> = BTreeMap::new();
    let mut running: JoinSet<()> = JoinSet::new();

    loop {
        let next_due = queue.keys().next().copied();

        tokio::select! {
            _ = shutdown.changed() => break,

            cmd = cmd_rx.recv() => match cmd {
                Some(Command::Schedule { job }) => {
                    tracing::info!(
                        job_id = %job.id,
                        target = %job.target,
                        interval_secs = job.interval.as_secs(),
                        profile = %job.profile,
                        "Recurring scan registered"
                    );
                    queue.insert((Instant::now(), job.id), job);
                }
                Some(Command::Cancel { job_id, reply }) => {
                    let key = queue.keys().find(|k| k.1 == job_id).copied();
                    let removed = match key {
                        Some(k) => queue.remove(&k).is_some(),
                        None => false,
                    };
                    if removed {
                        tracing::info!(job_id = %job_id, "Recurring scan cancelled");
                    }
                    let _ = reply.send(removed);
                }
                Some(Command::Manual(request)) => {
                    spawn_scan(
                        &mut running,
                        &cfg,
                        &scanner,
                        &semaphore,
                        &events,
                        &shutdown,
                        request.job_id,
                        request.target,
                        request.profile,
                        request.timeout,
                        Some(request.reply),
                    );
                }
                None => break,
            },

            _ = sleep_until(next_due.map(|(t, _)| t).unwrap_or_else(Instant::now)),
                if next_due.is_some() =>
            {
                let now = Instant::now();
                loop {
                    let Some((&(due, id), _)) = queue.first_key_value() else {
                        break;
                    };
                    if due > now {
                        break;
                    }
                    if let Some(job) = queue.remove(&(due, id)) {
                        spawn_scan(
                            &mut running,
                            &cfg,
                            &scanner,
                            &semaphore,
                            &events,
                            &shutdown,
                            job.id,
                            job.target.clone(),
                            job.profile,
                            cfg.scan_timeout,
                            None,
                        );
                        // Retry exhaustion never cancels future occurrences.
                        queue.insert((now + job.interval, job.id), job);
                    }
                }
            }

            Some(result) = running.join_next(), if !running.is_empty() => {
                if let Err(e) = result {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Scan task panicked");
                    }
                }
            }
        }
    }

    // Shutdown: give in-flight scans the grace window, then abandon them
    // and discard whatever they eventually produce.
    let drain = async {
        while running.join_next().await.is_some() {}
    };
    if timeout(cfg.shutdown_grace, drain).await.is_err() {
        tracing::warn!(
            abandoned = running.len(),
            "Grace period elapsed, abandoning in-flight scans"
        );
        running.shutdown().await;
    }
}

/// Spawn one scan task. The task acquires a concurrency permit before
/// touching the scanner and observes the shutdown signal at every await.
#[allow(clippy::too_many_arguments)]
fn spawn_scan(
    running: &mut JoinSet<()>,
    cfg: &SchedulerConfig,
    scanner: &Arc<dyn Scanner>,
    semaphore: &Arc<Semaphore>,
    events: &mpsc::Sender<SchedulerEvent>,
    shutdown: &watch::Receiver<bool>,
    job_id: JobId,
    target: ScanTarget,
    profile: ScanProfile,
    scan_timeout: Duration,
    reply: Option<oneshot::Sender<Result<NetworkSnapshot, VigilError>>>,
) {
    let scanner = scanner.clone();
    let semaphore = semaphore.clone();
    let events = events.clone();
    let mut shutdown = shutdown.clone();
    let policy = cfg.retry_policy();

    running.spawn(async move {
        // Backpressure: wait for a permit rather than rejecting the job.
        let _permit = tokio::select! {
            permit = semaphore.acquire_owned() => match permit {
                Ok(p) => p,
                Err(_) => return,
            },
            _ = shutdown.changed() => {
                deliver(reply, Err(VigilError::Unavailable("scheduler stopping".to_string())));
                return;
            }
        };

        let _ = events
            .send(SchedulerEvent::ScanStarted {
                job_id,
                target: target.to_string(),
                profile,
            })
            .await;

        let started = Instant::now();
        let outcome = tokio::select! {
            result = run_with_retries(&*scanner, &target, profile, scan_timeout, &policy) => result,
            _ = shutdown.changed() => {
                tracing::info!(job_id = %job_id, target = %target, "Scan cancelled during shutdown");
                deliver(reply, Err(VigilError::Scan(ScanError::Cancelled.to_string())));
                return;
            }
        };

        match outcome {
            Ok((devices, attempt_errors)) => {
                let snapshot = NetworkSnapshot::assemble(
                    devices,
                    SnapshotMetadata {
                        scan_duration_ms: started.elapsed().as_millis() as u64,
                        scan_type: profile,
                        errors: attempt_errors,
                    },
                );
                tracing::info!(
                    job_id = %job_id,
                    snapshot_id = %snapshot.id,
                    target = %target,
                    device_count = snapshot.device_count,
                    duration_ms = snapshot.metadata.scan_duration_ms,
                    "Scan complete"
                );
                let _ = events
                    .send(SchedulerEvent::SnapshotReady {
                        job_id,
                        snapshot: snapshot.clone(),
                    })
                    .await;
                deliver(reply, Ok(snapshot));
            }
            Err((error, attempts)) => {
                tracing::error!(
                    job_id = %job_id,
                    target = %target,
                    error = %error,
                    attempts,
                    "Scan failed, retries exhausted"
                );
                let _ = events
                    .send(SchedulerEvent::ScanFailed {
                        job_id,
                        target: target.to_string(),
                        error: error.to_string(),
                        attempts,
                    })
                    .await;
                deliver(reply, Err(error.into()));
            }
        }
    });
}

/// Run the scan with doubling backoff between transient failures.
///
/// Returns the device list plus the messages of any failed attempts, or
/// the final error with the number of attempts made.
async fn run_with_retries(
    scanner: &dyn Scanner,
    target: &ScanTarget,
    profile: ScanProfile,
    scan_timeout: Duration,
    policy: &RetryPolicy,
) -> Result<(Vec<Device>, Vec<String>), (ScanError, u32)> {
    let mut errors = Vec::new();
    let mut attempt = 0;
    loop {
        match scanner.scan(target, profile, scan_timeout).await {
            Ok(devices) => return Ok((devices, errors)),
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(
                    target = %target,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Scan attempt failed, backing off"
                );
                errors.push(format!("attempt {}: {e}", attempt + 1));
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err((e, attempt + 1)),
        }
    }
}

fn deliver(
    reply: Option<oneshot::Sender<Result<NetworkSnapshot, VigilError>>>,
    result: Result<NetworkSnapshot, VigilError>,
) {
    if let Some(tx) = reply {
        let _ = tx.send(result);
    }
}
