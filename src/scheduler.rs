use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Local, Timelike, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use crate::analytics;
use crate::config::SchedulerConfig;
use crate::database::SchedulerDatabase;
use crate::models::JobOrigin;
use crate::orchestrator::ResponseOrchestrator;

const IMMEDIATE_BATCH_LIMIT: usize = 50;
const MAIN_BATCH_LIMIT: usize = 200;

/// Users active within this window get the low-latency immediate cycle.
const IMMEDIATE_ACTIVE_HOURS: u32 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleKind {
    Immediate,
    Main,
    Analytics,
    Cleanup,
}

impl CycleKind {
    pub const ALL: [CycleKind; 4] = [
        CycleKind::Immediate,
        CycleKind::Main,
        CycleKind::Analytics,
        CycleKind::Cleanup,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CycleKind::Immediate => "immediate",
            CycleKind::Main => "main",
            CycleKind::Analytics => "analytics",
            CycleKind::Cleanup => "cleanup",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "immediate" => Some(CycleKind::Immediate),
            "main" => Some(CycleKind::Main),
            "analytics" => Some(CycleKind::Analytics),
            "cleanup" => Some(CycleKind::Cleanup),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleStatus {
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub runs: u64,
    pub failures: u64,
}

/// Process-scoped cycle driver. Initialized at boot, passed explicitly to
/// whoever needs control, and stopped by dropping the loop task at shutdown.
/// Every cycle is idempotent: skipping or repeating one tick never corrupts
/// scheduling state, because all coordination lives in the store.
pub struct CycleRunner {
    orchestrator: Arc<ResponseOrchestrator>,
    db: Arc<SchedulerDatabase>,
    config: SchedulerConfig,
    paused: AtomicBool,
    statuses: RwLock<HashMap<CycleKind, CycleStatus>>,
    last_cleanup_day: RwLock<Option<String>>,
}

impl CycleRunner {
    pub fn new(orchestrator: Arc<ResponseOrchestrator>, config: SchedulerConfig) -> Self {
        Self {
            db: orchestrator.database(),
            orchestrator,
            config,
            paused: AtomicBool::new(false),
            statuses: RwLock::new(HashMap::new()),
            last_cleanup_day: RwLock::new(None),
        }
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        tracing::info!(paused, "Scheduler pause state changed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub async fn statuses(&self) -> Vec<(CycleKind, CycleStatus)> {
        let statuses = self.statuses.read().await;
        CycleKind::ALL
            .iter()
            .map(|kind| (*kind, statuses.get(kind).cloned().unwrap_or_default()))
            .collect()
    }

    /// Run one named cycle now, recording its outcome in the status table.
    pub async fn run_cycle(&self, kind: CycleKind) -> Result<()> {
        let now = Utc::now();
        let result = match kind {
            CycleKind::Immediate => self.run_immediate(now).await,
            CycleKind::Main => self.run_main(now).await,
            CycleKind::Analytics => self.run_analytics(now),
            CycleKind::Cleanup => self.run_cleanup(now),
        };

        let mut statuses = self.statuses.write().await;
        let status = statuses.entry(kind).or_default();
        status.last_run_at = Some(now);
        status.next_run_at = Some(now + ChronoDuration::seconds(self.interval_secs(kind) as i64));
        status.runs += 1;
        if let Err(e) = &result {
            status.failures += 1;
            tracing::error!(cycle = kind.as_str(), error = %e, "Cycle run failed");
        }
        result
    }

    fn interval_secs(&self, kind: CycleKind) -> u64 {
        match kind {
            CycleKind::Immediate => self.config.immediate_cycle_secs,
            CycleKind::Main => self.config.main_cycle_secs,
            CycleKind::Analytics => self.config.analytics_cycle_secs,
            CycleKind::Cleanup => 24 * 3600,
        }
    }

    /// Due jobs for recently-active users only, to keep their latency low.
    async fn run_immediate(&self, now: DateTime<Utc>) -> Result<()> {
        let stats = self
            .orchestrator
            .run_due_jobs(now, Some(IMMEDIATE_ACTIVE_HOURS), IMMEDIATE_BATCH_LIMIT)
            .await?;
        if stats.processed > 0 {
            tracing::info!(
                delivered = stats.delivered,
                skipped = stats.skipped,
                rescheduled = stats.rescheduled,
                errors = stats.errors,
                "Immediate cycle processed due jobs"
            );
        }
        Ok(())
    }

    /// Full sweep: plan jobs for new entries, plan follow-ups for unanswered
    /// replies, then execute everything due. One entry's failure never
    /// aborts the sweep.
    async fn run_main(&self, now: DateTime<Utc>) -> Result<()> {
        let since = now - ChronoDuration::hours(self.config.sweep_lookback_hours as i64);
        let mut planned = 0;
        for entry in self.db.entries_without_jobs(since)? {
            match self
                .orchestrator
                .plan_jobs_for_entry(&entry, JobOrigin::Sweep, now)
            {
                Ok(created) => planned += created,
                Err(e) => {
                    tracing::warn!(
                        entry_id = %entry.id,
                        user_id = %entry.user_id,
                        error = %e,
                        "Failed to plan jobs for entry; continuing sweep"
                    );
                }
            }
        }

        let followups = self.orchestrator.plan_followup_jobs(now).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Follow-up planning failed; continuing sweep");
            0
        });

        let stats = self
            .orchestrator
            .run_due_jobs(now, None, MAIN_BATCH_LIMIT)
            .await?;
        tracing::info!(
            planned,
            followups,
            processed = stats.processed,
            delivered = stats.delivered,
            "Main cycle complete"
        );
        Ok(())
    }

    fn run_analytics(&self, now: DateTime<Utc>) -> Result<()> {
        let report = analytics::capture_snapshot(&self.db, now)?;
        tracing::info!(
            delivered = report.delivered,
            failed = report.failed_deliveries,
            skipped = report.skipped,
            pending = report.pending,
            "Analytics snapshot captured"
        );
        Ok(())
    }

    fn run_cleanup(&self, now: DateTime<Utc>) -> Result<()> {
        let expired = self
            .db
            .expire_pending_jobs(now - ChronoDuration::hours(self.config.pending_ttl_hours as i64))?;
        let released = self
            .db
            .release_expired_leases(now - ChronoDuration::seconds(self.config.lease_timeout_secs as i64))?;
        let today = now.with_timezone(&Local).format("%Y-%m-%d").to_string();
        let reset = self.db.reset_stale_daily_counts(&today)?;
        let pruned =
            analytics::prune_snapshots(&self.db, now, self.config.analytics_retention_days)?;
        tracing::info!(expired, released, reset, pruned, "Cleanup cycle complete");
        Ok(())
    }

    /// Main loop: releases stranded leases from a previous process, then
    /// drives all four cadences until the task is dropped.
    pub async fn run_loop(self: Arc<Self>) {
        tracing::info!("Cycle runner starting");
        let lease_cutoff = Utc::now()
            - ChronoDuration::seconds(self.config.lease_timeout_secs as i64);
        match self.db.release_expired_leases(lease_cutoff) {
            Ok(0) => {}
            Ok(n) => tracing::warn!(released = n, "Reset jobs stranded in GENERATING at boot"),
            Err(e) => tracing::error!(error = %e, "Failed to release stranded leases at boot"),
        }

        let mut last_run: HashMap<CycleKind, DateTime<Utc>> = HashMap::new();
        loop {
            if self.is_paused() {
                sleep(Duration::from_secs(5)).await;
                continue;
            }

            let now = Utc::now();
            for kind in [CycleKind::Immediate, CycleKind::Main, CycleKind::Analytics] {
                let due = last_run
                    .get(&kind)
                    .map(|last| (now - *last).num_seconds() >= self.interval_secs(kind) as i64)
                    .unwrap_or(true);
                if due {
                    last_run.insert(kind, now);
                    // Errors are recorded in the status table; the loop goes on.
                    let _ = self.run_cycle(kind).await;
                }
            }

            self.maybe_run_cleanup(now).await;

            sleep(Duration::from_secs(self.config.immediate_cycle_secs.min(30).max(1))).await;
        }
    }

    /// Run the cleanup cycle if it is due. The day is marked only after a
    /// successful run; a failed cleanup stays due and is retried on the next
    /// tick.
    async fn maybe_run_cleanup(&self, now: DateTime<Utc>) {
        if !self.cleanup_due(now).await {
            return;
        }
        if self.run_cycle(CycleKind::Cleanup).await.is_ok() {
            *self.last_cleanup_day.write().await =
                Some(now.with_timezone(&Local).format("%Y-%m-%d").to_string());
        }
    }

    /// Cleanup runs once per local day, at or after the configured hour.
    async fn cleanup_due(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&Local);
        if local.hour() < self.config.cleanup_hour_local {
            return false;
        }
        let today = local.format("%Y-%m-%d").to_string();
        self.last_cleanup_day
            .read()
            .await
            .as_deref()
            .map(|last| last != today)
            .unwrap_or(true)
    }
}
