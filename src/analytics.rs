use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::database::SchedulerDatabase;
use crate::models::JobState;

/// One read-only aggregation pass over job state. Never mutates jobs or
/// responses; the cleanup cycle prunes old snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsReport {
    pub captured_at: DateTime<Utc>,
    pub delivered: u64,
    /// Jobs abandoned after collaborator failures.
    pub failed_deliveries: u64,
    pub skipped: u64,
    pub pending: u64,
    pub failure_reasons: HashMap<String, u64>,
    pub avg_delivery_latency_secs: Option<f64>,
}

pub fn capture_snapshot(
    db: &Arc<SchedulerDatabase>,
    now: DateTime<Utc>,
) -> Result<AnalyticsReport> {
    let states = db.job_state_counts()?;
    let reasons = db.skip_reason_counts()?;

    let delivered = states.get(&JobState::Delivered).copied().unwrap_or(0);
    let skipped = states.get(&JobState::Skipped).copied().unwrap_or(0);
    let pending = states.get(&JobState::Pending).copied().unwrap_or(0)
        + states.get(&JobState::Generating).copied().unwrap_or(0);

    let failure_reasons: HashMap<String, u64> = reasons
        .iter()
        .filter(|(reason, _)| reason.starts_with("collaborator_"))
        .map(|(reason, count)| (reason.clone(), *count))
        .collect();
    let failed_deliveries = failure_reasons.values().sum();

    let avg_latency = db.avg_delivery_latency_secs()?;
    let report = AnalyticsReport {
        captured_at: now,
        delivered,
        failed_deliveries,
        skipped,
        pending,
        failure_reasons,
        avg_delivery_latency_secs: avg_latency,
    };

    db.insert_analytics_snapshot(
        &uuid::Uuid::new_v4().to_string(),
        now,
        report.delivered,
        report.failed_deliveries,
        report.skipped,
        report.pending,
        &serde_json::to_string(&report.failure_reasons)?,
        report.avg_delivery_latency_secs,
    )?;
    Ok(report)
}

pub fn prune_snapshots(
    db: &Arc<SchedulerDatabase>,
    now: DateTime<Utc>,
    retention_days: u32,
) -> Result<usize> {
    db.prune_analytics(now - ChronoDuration::days(retention_days as i64))
}
