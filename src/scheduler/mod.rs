use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{watch, Semaphore};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::config::{
    BACKOFF_CAP_MULTIPLIER, JITTER_MAX_MS, SCHEDULER_TICK_SECS, SHUTDOWN_GRACE_SECS,
    SOFT_FAIL_WARN_THRESHOLD,
};
use crate::error::{AppError, Result};
use crate::executor::PollExecutor;
use crate::registry::WatchRegistry;
use crate::types::{now_ms, now_secs, CycleOutcome, CycleReport, LastResult, PollStatus, WatchDefinition};

// ---------------------------------------------------------------------------
// Per-watch poll state
// ---------------------------------------------------------------------------

/// Mutable scheduling state for one active watch. In-memory only; resets on
/// restart (cadence, not correctness).
#[derive(Debug)]
struct PollState {
    /// Millisecond epoch of the next scheduled poll.
    next_due_at: u64,
    consecutive_failures: u32,
    last_result: LastResult,
    /// A watch is never polled while a cycle for it is in flight.
    in_flight: bool,
    /// Set on fatal failure; the watch is not polled again until a reload.
    disabled_reason: Option<String>,
}

impl PollState {
    /// Fresh state: due immediately.
    fn new_due(now: u64) -> Self {
        Self {
            next_due_at: now,
            consecutive_failures: 0,
            last_result: LastResult::NeverRun,
            in_flight: false,
            disabled_reason: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Stats {
    total_polls: AtomicU64,
    successful_polls: AtomicU64,
    failed_polls: AtomicU64,
    listings_fetched: AtomicU64,
    notifications_sent: AtomicU64,
    dispatch_failures: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub watches: usize,
    pub disabled_watches: usize,
    pub in_flight: usize,
    pub total_polls: u64,
    pub successful_polls: u64,
    pub failed_polls: u64,
    pub listings_fetched: u64,
    pub notifications_sent: u64,
    pub dispatch_failures: u64,
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// The only component that initiates work. A 1s tick scans for due watches,
/// takes a concurrency slot per poll and hands the cycle to the executor;
/// outcomes adjust each watch's next-due time independently.
pub struct Scheduler {
    registry: Arc<WatchRegistry>,
    executor: Arc<PollExecutor>,
    states: DashMap<String, PollState>,
    slots: Arc<Semaphore>,
    concurrency: usize,
    stats: Stats,
    started_at: u64,
}

impl Scheduler {
    pub fn new(
        registry: Arc<WatchRegistry>,
        executor: Arc<PollExecutor>,
        concurrency: usize,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            registry: registry.clone(),
            executor,
            states: DashMap::new(),
            slots: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            stats: Stats::default(),
            started_at: now_secs(),
        });
        scheduler.reconcile(&registry.snapshot());
        scheduler
    }

    /// Tick loop. Returns after a shutdown signal, once in-flight cycles
    /// have drained (bounded by the grace timeout).
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = interval(Duration::from_secs(SCHEDULER_TICK_SECS));
        info!(
            watches = self.states.len(),
            concurrency = self.concurrency,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.clone().tick(),
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Scheduler stopping, draining in-flight polls");
        match tokio::time::timeout(
            Duration::from_secs(SHUTDOWN_GRACE_SECS),
            self.slots.acquire_many(self.concurrency as u32),
        )
        .await
        {
            Ok(_) => info!("All in-flight polls drained"),
            Err(_) => warn!(
                grace_secs = SHUTDOWN_GRACE_SECS,
                "Shutdown grace period expired with polls still in flight"
            ),
        }
    }

    fn tick(self: Arc<Self>) {
        let now = now_ms();
        let mut due = self.due_watches(now);
        // Most overdue first, so short-interval watches cannot starve
        // long-interval ones by registry position.
        due.sort_by_key(|(due_at, _)| *due_at);

        for (_, watch) in due {
            let permit = match Arc::clone(&self.slots).try_acquire_owned() {
                Ok(p) => p,
                // All slots busy; the rest stay due for the next tick.
                Err(_) => break,
            };
            if !self.try_begin(&watch.name) {
                continue;
            }

            let scheduler = Arc::clone(&self);
            tokio::spawn(async move {
                let _permit = permit;
                debug!(watch = %watch.name, "Poll cycle starting");
                let report = scheduler.executor.run_cycle(&watch, false).await;
                scheduler.complete(&watch, &report);
            });
        }
    }

    fn due_watches(&self, now: u64) -> Vec<(u64, WatchDefinition)> {
        let snapshot = self.registry.snapshot();
        let mut due = Vec::new();
        for watch in snapshot.iter() {
            if let Some(state) = self.states.get(&watch.name) {
                if !state.in_flight
                    && state.disabled_reason.is_none()
                    && now >= state.next_due_at
                {
                    due.push((state.next_due_at, watch.clone()));
                }
            }
        }
        due
    }

    /// Set the in-flight flag; false when a cycle is already running (or the
    /// watch is gone). The caller must not start a cycle on false.
    fn try_begin(&self, name: &str) -> bool {
        match self.states.get_mut(name) {
            Some(mut state) if !state.in_flight => {
                state.in_flight = true;
                true
            }
            _ => false,
        }
    }

    /// Executor completion callback: fold the cycle outcome into the watch's
    /// poll state and compute its next-due time.
    fn complete(&self, watch: &WatchDefinition, report: &CycleReport) {
        self.stats.total_polls.fetch_add(1, Ordering::Relaxed);
        self.stats
            .listings_fetched
            .fetch_add(report.fetched as u64, Ordering::Relaxed);
        self.stats
            .notifications_sent
            .fetch_add(report.notified as u64, Ordering::Relaxed);
        self.stats
            .dispatch_failures
            .fetch_add(report.dispatch_failures as u64, Ordering::Relaxed);
        match report.outcome {
            CycleOutcome::Success => {
                self.stats.successful_polls.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.stats.failed_polls.fetch_add(1, Ordering::Relaxed);
            }
        }

        let now = now_ms();
        let Some(mut state) = self.states.get_mut(&watch.name) else {
            // Removed by a reload while its last cycle was in flight.
            debug!(watch = %watch.name, "Completion for a removed watch, dropping state");
            return;
        };
        state.in_flight = false;

        match &report.outcome {
            CycleOutcome::Success => {
                state.consecutive_failures = 0;
                state.last_result = LastResult::Success;
                state.next_due_at =
                    now + watch.polling_interval_secs * 1_000 + jitter_ms();
            }
            CycleOutcome::SoftFail(reason) => {
                state.consecutive_failures += 1;
                state.last_result = LastResult::SoftFail;
                let delay =
                    backoff_delay_ms(watch.polling_interval_secs, state.consecutive_failures);
                state.next_due_at = now + delay + jitter_ms();
                if state.consecutive_failures >= SOFT_FAIL_WARN_THRESHOLD {
                    warn!(
                        watch = %watch.name,
                        failures = state.consecutive_failures,
                        "Watch keeps soft-failing: {reason}"
                    );
                } else {
                    debug!(
                        watch = %watch.name,
                        failures = state.consecutive_failures,
                        delay_ms = delay,
                        "Soft failure, backing off: {reason}"
                    );
                }
            }
            CycleOutcome::FatalFail(reason) => {
                state.last_result = LastResult::FatalFail;
                state.disabled_reason = Some(reason.clone());
                error!(watch = %watch.name, "Watch disabled after fatal failure: {reason}");
            }
        }
    }

    /// Re-read the watch file and reconcile poll state: watches present in
    /// both sets keep their backoff progress, removed ones are dropped, new
    /// ones start due immediately.
    pub fn reload(&self) -> Result<usize> {
        let snapshot = self.registry.reload()?;
        self.reconcile(&snapshot);
        Ok(snapshot.len())
    }

    fn reconcile(&self, watches: &[WatchDefinition]) {
        let now = now_ms();
        let names: HashSet<&str> = watches.iter().map(|w| w.name.as_str()).collect();
        self.states.retain(|name, _| names.contains(name.as_str()));
        for watch in watches {
            self.states
                .entry(watch.name.clone())
                .or_insert_with(|| PollState::new_due(now));
        }
    }

    /// Run one immediate poll cycle for a named watch, respecting the
    /// at-most-one-in-flight guard and the global concurrency cap. In
    /// dry-run mode the outcome does not touch scheduling state.
    pub async fn trigger_now(&self, name: &str, dry_run: bool) -> Result<CycleReport> {
        let watch = self
            .registry
            .get(name)
            .ok_or_else(|| AppError::UnknownWatch(name.to_string()))?;
        if !self.try_begin(name) {
            return Err(AppError::PollInFlight(name.to_string()));
        }

        let _permit = self.slots.acquire().await;
        let report = self.executor.run_cycle(&watch, dry_run).await;

        if dry_run {
            if let Some(mut state) = self.states.get_mut(name) {
                state.in_flight = false;
            }
        } else {
            self.complete(&watch, &report);
        }
        Ok(report)
    }

    pub fn statuses(&self) -> Vec<PollStatus> {
        let now = now_ms();
        self.registry
            .snapshot()
            .iter()
            .filter_map(|watch| {
                self.states.get(&watch.name).map(|state| PollStatus {
                    name: watch.name.clone(),
                    domain: watch.domain.clone(),
                    query: watch.query.clone(),
                    polling_interval_secs: watch.polling_interval_secs,
                    last_result: state.last_result,
                    consecutive_failures: state.consecutive_failures,
                    in_flight: state.in_flight,
                    next_due_in_ms: state.next_due_at.saturating_sub(now),
                    disabled_reason: state.disabled_reason.clone(),
                })
            })
            .collect()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        let disabled = self
            .states
            .iter()
            .filter(|s| s.disabled_reason.is_some())
            .count();
        let in_flight = self.states.iter().filter(|s| s.in_flight).count();
        StatsSnapshot {
            uptime_secs: now_secs().saturating_sub(self.started_at),
            watches: self.states.len(),
            disabled_watches: disabled,
            in_flight,
            total_polls: self.stats.total_polls.load(Ordering::Relaxed),
            successful_polls: self.stats.successful_polls.load(Ordering::Relaxed),
            failed_polls: self.stats.failed_polls.load(Ordering::Relaxed),
            listings_fetched: self.stats.listings_fetched.load(Ordering::Relaxed),
            notifications_sent: self.stats.notifications_sent.load(Ordering::Relaxed),
            dispatch_failures: self.stats.dispatch_failures.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Backoff delay after `consecutive_failures` soft failures (count already
/// incremented): interval * min(2^failures, cap).
fn backoff_delay_ms(interval_secs: u64, consecutive_failures: u32) -> u64 {
    let multiplier = 1u64
        .checked_shl(consecutive_failures)
        .unwrap_or(u64::MAX)
        .min(BACKOFF_CAP_MULTIPLIER as u64);
    interval_secs * 1_000 * multiplier
}

fn jitter_ms() -> u64 {
    rand::rng().random_range(0..=JITTER_MAX_MS)
}
