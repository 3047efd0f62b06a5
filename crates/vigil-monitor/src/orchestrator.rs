//! The monitoring orchestrator.
//!
//! The single component the API layer calls. It owns the lifecycle state
//! machine, wires the scheduler to the store and the diff engine, runs the
//! health-check loop, and publishes the typed event stream consumed by
//! notification collaborators.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use vigil_core::events::{EventPayload, MonitorEvent};
use vigil_core::types::{
    ComponentState, HealthStatus, MonitoringMetrics, NetworkSnapshot, ScanProfile, SnapshotDiff,
    SnapshotId,
};
use vigil_core::VigilError;
use vigil_diff::{compute_diff_with, DeviceIdentity, DiffOptions};
use vigil_store::{Page, Pagination, SnapshotFilter, SnapshotStore};

use crate::config::MonitorConfig;
use crate::health;
use crate::resilience::{retry, CircuitBreaker, RetryPolicy};
use crate::scanner::Scanner;
use crate::scheduler::{Scheduler, SchedulerConfig, SchedulerEvent};

/// Orchestrator lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LifecycleState::Stopped => "stopped",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Everything that only exists while the monitor is running.
struct Runtime {
    scheduler: Arc<Scheduler>,
    event_task: JoinHandle<()>,
    health_task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Shared context for the snapshot-handling pipeline.
#[derive(Clone)]
struct PipelineCtx {
    store: Arc<dyn SnapshotStore>,
    breaker: Arc<CircuitBreaker>,
    retry_policy: RetryPolicy,
    metrics: Arc<Mutex<MonitoringMetrics>>,
    events: broadcast::Sender<MonitorEvent>,
    threshold: u32,
    diff_options: DiffOptions,
}

/// Top-level coordinator for scanning, persistence, diffing, and health.
pub struct Orchestrator {
    config: MonitorConfig,
    scanner: Arc<dyn Scanner>,
    store: Arc<dyn SnapshotStore>,
    state: Mutex<LifecycleState>,
    runtime: Mutex<Option<Runtime>>,
    // One stateful breaker per protected operation class, reused across
    // restarts so failure history survives a lifecycle bounce.
    storage_breaker: Arc<CircuitBreaker>,
    store_retry: RetryPolicy,
    metrics: Arc<Mutex<MonitoringMetrics>>,
    health: Arc<Mutex<HealthStatus>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
    events: broadcast::Sender<MonitorEvent>,
    diff_options: DiffOptions,
}

impl Orchestrator {
    pub fn new(
        config: MonitorConfig,
        scanner: Arc<dyn Scanner>,
        store: Arc<dyn SnapshotStore>,
    ) -> Self {
        let (events, _) = broadcast::channel(256);
        let storage_breaker = Arc::new(CircuitBreaker::new(
            "storage",
            config.storage_failure_threshold,
            Duration::from_secs(config.storage_reset_timeout_secs),
        ));
        let store_retry = RetryPolicy {
            max_attempts: config.max_retries + 1,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            backoff_multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        };
        let diff_options = DiffOptions {
            identity: if config.track_by_mac {
                DeviceIdentity::Mac
            } else {
                DeviceIdentity::Ip
            },
        };

        Self {
            config,
            scanner,
            store,
            state: Mutex::new(LifecycleState::Stopped),
            runtime: Mutex::new(None),
            storage_breaker,
            store_retry,
            metrics: Arc::new(Mutex::new(MonitoringMetrics::default())),
            health: Arc::new(Mutex::new(HealthStatus {
                state: ComponentState::Healthy,
                components: vec![],
                checked_at: Utc::now(),
            })),
            started_at: Mutex::new(None),
            events,
            diff_options,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *lock(&self.state)
    }

    /// Subscribe to the typed event stream. Fire-and-forget: lagging
    /// subscribers miss events rather than slowing the pipeline.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    // ── Lifecycle ─────────────────────────────────────────────────

    /// Bring the monitor up: validate config, prepare storage, start the
    /// event and health loops, start the scheduler, register configured
    /// targets. Each step must succeed before the next runs.
    pub async fn start(&self) -> Result<(), VigilError> {
        self.transition("start", &[LifecycleState::Stopped], LifecycleState::Starting)?;

        match self.start_inner().await {
            Ok(runtime) => {
                *lock(&self.runtime) = Some(runtime);
                *lock(&self.started_at) = Some(Utc::now());
                self.set_state(LifecycleState::Running);
                tracing::info!("Monitor running");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "Startup failed");
                self.set_state(LifecycleState::Error);
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<Runtime, VigilError> {
        self.config.validate()?;

        // Storage must be reachable and at a supported schema before any
        // other component comes up.
        let store = self.store.clone();
        retry(&self.store_retry, || {
            let store = store.clone();
            async move { store.migrate().await }
        })
        .await
        .map_err(VigilError::from)?;
        retry(&self.store_retry, || {
            let store = store.clone();
            async move { store.probe().await }
        })
        .await
        .map_err(VigilError::from)?;

        let (event_tx, event_rx) = mpsc::channel::<SchedulerEvent>(64);
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::from(&self.config),
            self.scanner.clone(),
            event_tx,
        ));

        let (shutdown, _) = watch::channel(false);

        let ctx = PipelineCtx {
            store: self.store.clone(),
            breaker: self.storage_breaker.clone(),
            retry_policy: self.store_retry,
            metrics: self.metrics.clone(),
            events: self.events.clone(),
            threshold: self.config.significant_change_threshold,
            diff_options: self.diff_options,
        };

        // The event consumer subscribes before the dispatch loop starts so
        // no snapshot can slip past it.
        let event_task = tokio::spawn(run_event_loop(ctx, event_rx, shutdown.subscribe()));

        let health_task = tokio::spawn(run_health_loop(
            self.store.clone(),
            self.storage_breaker.clone(),
            scheduler.clone(),
            self.health.clone(),
            Duration::from_secs(self.config.health_interval_secs),
            shutdown.subscribe(),
        ));

        scheduler.start()?;

        for target in &self.config.targets {
            if !target.enabled {
                tracing::info!(range = %target.range, "Configured target disabled, skipping");
                continue;
            }
            let job_id = scheduler.schedule(
                &target.range,
                Duration::from_secs(target.interval_secs),
                target.profile,
            )?;
            tracing::info!(
                job_id = %job_id,
                range = %target.range,
                name = target.name.as_deref().unwrap_or("-"),
                "Default recurring scan registered"
            );
        }

        Ok(Runtime {
            scheduler,
            event_task,
            health_task,
            shutdown,
        })
    }

    /// Bring the monitor down. Idempotent when already stopped; fails with
    /// a wrong-state error while a transition is in flight.
    pub async fn stop(&self) -> Result<(), VigilError> {
        if self.state() == LifecycleState::Stopped {
            return Ok(());
        }
        self.transition(
            "stop",
            &[LifecycleState::Running, LifecycleState::Error],
            LifecycleState::Stopping,
        )?;

        let runtime = lock(&self.runtime).take();
        if let Some(rt) = runtime {
            // Scheduler first so its final events land in the still-running
            // event loop, then the loops.
            rt.scheduler.stop().await;
            let _ = rt.shutdown.send(true);
            join_or_abort(rt.event_task, "event loop").await;
            join_or_abort(rt.health_task, "health loop").await;
        }

        *lock(&self.started_at) = None;
        self.set_state(LifecycleState::Stopped);
        tracing::info!("Monitor stopped");
        Ok(())
    }

    /// Stop (if needed) and start again. The recovery path out of the
    /// error state.
    pub async fn restart(&self) -> Result<(), VigilError> {
        self.stop().await?;
        self.start().await
    }

    fn transition(
        &self,
        op: &'static str,
        from: &[LifecycleState],
        to: LifecycleState,
    ) -> Result<(), VigilError> {
        let mut state = lock(&self.state);
        if from.contains(&state) {
            *state = to;
            Ok(())
        } else {
            Err(VigilError::WrongState {
                op,
                state: state.to_string(),
            })
        }
    }

    fn set_state(&self, to: LifecycleState) {
        *lock(&self.state) = to;
    }

    // ── API surface ───────────────────────────────────────────────

    /// Run one scan immediately and wait for its snapshot. Uses the first
    /// configured target when no range is given.
    pub async fn trigger_manual_scan(
        &self,
        range: Option<&str>,
        profile: Option<ScanProfile>,
        timeout_override: Option<Duration>,
    ) -> Result<NetworkSnapshot, VigilError> {
        let scheduler = self.current_scheduler("trigger_manual_scan")?;
        let range = match range {
            Some(r) => r.to_string(),
            None => self
                .config
                .targets
                .first()
                .map(|t| t.range.clone())
                .ok_or_else(|| {
                    VigilError::Validation(
                        "no scan range given and no targets configured".to_string(),
                    )
                })?,
        };
        scheduler
            .trigger_manual(&range, profile, timeout_override)
            .await
    }

    pub async fn get_latest_snapshot(&self) -> Result<Option<NetworkSnapshot>, VigilError> {
        let store = self.store.clone();
        guarded(&self.storage_breaker, &self.store_retry, move || {
            let store = store.clone();
            async move { store.get_latest().await.map_err(VigilError::from) }
        })
        .await
    }

    pub async fn get_snapshot(&self, id: SnapshotId) -> Result<NetworkSnapshot, VigilError> {
        let store = self.store.clone();
        guarded(&self.storage_breaker, &self.store_retry, move || {
            let store = store.clone();
            async move { store.get_by_id(id).await.map_err(VigilError::from) }
        })
        .await
    }

    pub async fn list_snapshots(
        &self,
        filter: SnapshotFilter,
        page: Pagination,
    ) -> Result<Page<NetworkSnapshot>, VigilError> {
        let store = self.store.clone();
        guarded(&self.storage_breaker, &self.store_retry, move || {
            let store = store.clone();
            let filter = filter.clone();
            async move { store.list(&filter, page).await.map_err(VigilError::from) }
        })
        .await
    }

    /// Diff two stored snapshots. Both must exist; comparing an id with
    /// itself yields the empty diff. Nothing is persisted.
    pub async fn compare_snapshots(
        &self,
        from: SnapshotId,
        to: SnapshotId,
    ) -> Result<SnapshotDiff, VigilError> {
        let from_snap = self.get_snapshot(from).await?;
        let to_snap = if to == from {
            from_snap.clone()
        } else {
            self.get_snapshot(to).await?
        };
        Ok(compute_diff_with(&from_snap, &to_snap, &self.diff_options))
    }

    /// Diffs recorded within the trailing window.
    pub async fn get_recent_changes(
        &self,
        since_hours: u64,
    ) -> Result<Vec<SnapshotDiff>, VigilError> {
        let window = TimeDelta::try_hours(since_hours as i64).ok_or_else(|| {
            VigilError::Validation(format!("window of {since_hours}h is out of range"))
        })?;
        let since = Utc::now() - window;

        let store = self.store.clone();
        guarded(&self.storage_breaker, &self.store_retry, move || {
            let store = store.clone();
            async move {
                store
                    .list_recent_diffs(since)
                    .await
                    .map_err(VigilError::from)
            }
        })
        .await
    }

    pub fn get_health(&self) -> HealthStatus {
        lock(&self.health).clone()
    }

    pub fn get_metrics(&self) -> MonitoringMetrics {
        let mut metrics = lock(&self.metrics).clone();
        if let Some(started) = *lock(&self.started_at) {
            metrics.uptime_secs = (Utc::now() - started).num_seconds().max(0) as u64;
        }
        metrics
    }

    fn current_scheduler(&self, op: &'static str) -> Result<Arc<Scheduler>, VigilError> {
        let state = self.state();
        if state != LifecycleState::Running {
            return Err(VigilError::WrongState {
                op,
                state: state.to_string(),
            });
        }
        lock(&self.runtime)
            .as_ref()
            .map(|rt| rt.scheduler.clone())
            .ok_or(VigilError::WrongState {
                op,
                state: state.to_string(),
            })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn join_or_abort(mut handle: JoinHandle<()>, name: &'static str) {
    if timeout(Duration::from_secs(5), &mut handle).await.is_err() {
        tracing::warn!(task = name, "Task did not stop in time, aborting");
        handle.abort();
    }
}

/// Storage access pattern: circuit breaker outside, retry inside, so the
/// breaker counts retry-exhausted failures rather than individual attempts.
async fn guarded<T, F, Fut>(
    breaker: &CircuitBreaker,
    policy: &RetryPolicy,
    op: F,
) -> Result<T, VigilError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, VigilError>>,
{
    breaker
        .call(|| async { retry(policy, || op()).await })
        .await
}

fn publish(events: &broadcast::Sender<MonitorEvent>, payload: EventPayload) {
    let _ = events.send(MonitorEvent::new(payload));
}

/// Consume scheduler events one at a time. Serialization here guarantees a
/// diff is always computed against whichever snapshot was latest at
/// handling time; concurrent completions queue up in the channel.
async fn run_event_loop(
    ctx: PipelineCtx,
    mut events: mpsc::Receiver<SchedulerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            event = events.recv() => match event {
                Some(event) => handle_scheduler_event(&ctx, event).await,
                None => break,
            },
        }
    }

    // Drain what the scheduler emitted before the stop signal landed.
    while let Ok(event) = events.try_recv() {
        handle_scheduler_event(&ctx, event).await;
    }
}

async fn handle_scheduler_event(ctx: &PipelineCtx, event: SchedulerEvent) {
    match event {
        SchedulerEvent::ScanStarted {
            job_id,
            target,
            profile,
        } => {
            publish(
                &ctx.events,
                EventPayload::ScanStarted {
                    job_id,
                    target,
                    profile,
                },
            );
        }
        SchedulerEvent::ScanFailed {
            job_id,
            target,
            error,
            attempts,
        } => {
            lock(&ctx.metrics).scans_failed += 1;
            tracing::warn!(
                job_id = %job_id,
                target = %target,
                error = %error,
                attempts,
                "Scan job failed"
            );
            publish(
                &ctx.events,
                EventPayload::ScanFailed {
                    job_id,
                    target,
                    error,
                    attempts,
                },
            );
        }
        SchedulerEvent::SnapshotReady { job_id, snapshot } => {
            if let Err(e) = handle_snapshot(ctx, &snapshot).await {
                tracing::error!(
                    job_id = %job_id,
                    snapshot_id = %snapshot.id,
                    error = %e,
                    "Failed to record snapshot"
                );
            }
        }
    }
}

/// Persist a completed snapshot, diff it against the prior latest, persist
/// the diff, update metrics, and raise the significant-change signal when
/// the threshold is crossed.
async fn handle_snapshot(ctx: &PipelineCtx, snapshot: &NetworkSnapshot) -> Result<(), VigilError> {
    let store = ctx.store.clone();
    let prior = guarded(&ctx.breaker, &ctx.retry_policy, move || {
        let store = store.clone();
        async move { store.get_latest().await.map_err(VigilError::from) }
    })
    .await?;

    let store = ctx.store.clone();
    let snap = snapshot.clone();
    guarded(&ctx.breaker, &ctx.retry_policy, move || {
        let store = store.clone();
        let snap = snap.clone();
        async move { store.create(&snap).await.map_err(VigilError::from) }
    })
    .await?;

    {
        let mut metrics = lock(&ctx.metrics);
        metrics.scans_completed += 1;
        metrics.devices_discovered += snapshot.device_count as u64;
        metrics.last_scan_at = Some(snapshot.timestamp);
    }

    if let Some(prior) = prior.filter(|p| p.id != snapshot.id) {
        let diff = compute_diff_with(&prior, snapshot, &ctx.diff_options);

        let store = ctx.store.clone();
        let to_persist = diff.clone();
        guarded(&ctx.breaker, &ctx.retry_policy, move || {
            let store = store.clone();
            let diff = to_persist.clone();
            async move { store.create_diff(&diff).await.map_err(VigilError::from) }
        })
        .await?;

        let total = diff.summary.total_changes();
        lock(&ctx.metrics).changes_detected += total as u64;

        tracing::info!(
            from = %prior.id,
            to = %snapshot.id,
            total_changes = total,
            devices_added = diff.summary.devices_added,
            devices_removed = diff.summary.devices_removed,
            devices_changed = diff.summary.devices_changed,
            "Snapshot diff recorded"
        );

        publish(
            &ctx.events,
            EventPayload::SnapshotRecorded {
                snapshot_id: snapshot.id,
                device_count: snapshot.device_count,
                total_ports: snapshot.total_ports,
                scan_duration_ms: snapshot.metadata.scan_duration_ms,
            },
        );

        if total > ctx.threshold {
            lock(&ctx.metrics).significant_changes += 1;
            tracing::warn!(
                diff_id = %diff.id,
                total_changes = total,
                threshold = ctx.threshold,
                "Significant network change detected"
            );
            publish(
                &ctx.events,
                EventPayload::SignificantChange {
                    diff_id: diff.id,
                    from_snapshot: prior.id,
                    to_snapshot: snapshot.id,
                    total_changes: total,
                    threshold: ctx.threshold,
                },
            );
        }
    } else {
        publish(
            &ctx.events,
            EventPayload::SnapshotRecorded {
                snapshot_id: snapshot.id,
                device_count: snapshot.device_count,
                total_ports: snapshot.total_ports,
                scan_duration_ms: snapshot.metadata.scan_duration_ms,
            },
        );
    }

    Ok(())
}

/// Recompute component health on an independent cadence. Probe failures
/// degrade the reported state; they never stop the monitor.
async fn run_health_loop(
    store: Arc<dyn SnapshotStore>,
    breaker: Arc<CircuitBreaker>,
    scheduler: Arc<Scheduler>,
    slot: Arc<Mutex<HealthStatus>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let components = vec![
                    health::probe_storage(&*store).await,
                    health::scheduler_health(&scheduler),
                    health::breaker_health(&breaker),
                ];
                let status = health::aggregate(components);
                if status.state != ComponentState::Healthy {
                    tracing::warn!(state = ?status.state, "Monitor health degraded");
                }
                *lock(&slot) = status;
            }
        }
    }
}
