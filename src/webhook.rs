use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use rand::Rng;
use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::database::SchedulerDatabase;
use crate::models::{EntryCreatedEvent, JobOrigin, JobState, SchedulingJob};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayOutcome {
    Enqueued { job_id: String },
    /// Cheap-check rejection; the reason is the audit tag.
    Rejected(&'static str),
    /// A job for this entry already exists (webhook retry, or the sweep got
    /// there first).
    AlreadyQueued,
}

/// Fast-path producer for "entry created" events. Runs only the cheap gates
/// (length, not an AI response) and enqueues an immediate PENDING job for the
/// default persona; the full policy and selection run again at execution
/// time, so the gateway shortens latency without weakening any check.
pub struct WebhookGateway {
    db: Arc<SchedulerDatabase>,
    config: SchedulerConfig,
}

impl WebhookGateway {
    pub fn new(db: Arc<SchedulerDatabase>, config: SchedulerConfig) -> Self {
        Self { db, config }
    }

    pub fn on_entry_created(
        &self,
        event: &EntryCreatedEvent,
        now: DateTime<Utc>,
    ) -> Result<GatewayOutcome> {
        if event.content_length < self.config.min_entry_chars {
            tracing::debug!(
                entry_id = %event.entry_id,
                content_length = event.content_length,
                "Webhook rejected entry: content_too_short"
            );
            return Ok(GatewayOutcome::Rejected("content_too_short"));
        }

        // The AI-to-AI gate sits at the earliest ingress point; the mirrored
        // entry row carries the authoritative tag. An event arriving before
        // its entry row is rejected and left to the sweep, which only sees
        // mirrored rows.
        match self.db.get_journal_entry(&event.entry_id)? {
            Some(entry) if entry.is_ai_response => {
                tracing::debug!(
                    entry_id = %event.entry_id,
                    "Webhook rejected entry: entry_is_ai_response"
                );
                return Ok(GatewayOutcome::Rejected("entry_is_ai_response"));
            }
            Some(_) => {}
            None => {
                tracing::debug!(
                    entry_id = %event.entry_id,
                    "Webhook rejected entry: entry_not_mirrored"
                );
                return Ok(GatewayOutcome::Rejected("entry_not_mirrored"));
            }
        }

        let today = now.with_timezone(&Local).format("%Y-%m-%d").to_string();
        self.db
            .touch_last_active(&event.user_id, event.created_at, &today)?;

        let jitter = {
            let mut rng = rand::thread_rng();
            ChronoDuration::minutes(rng.gen_range(
                self.config.immediate_jitter_min_mins as i64
                    ..=self.config.immediate_jitter_max_mins as i64,
            ))
        };
        let job = SchedulingJob {
            id: uuid::Uuid::new_v4().to_string(),
            journal_entry_id: event.entry_id.clone(),
            user_id: event.user_id.clone(),
            persona: self.config.default_persona,
            state: JobState::Pending,
            scheduled_at: now + jitter,
            attempt_count: 0,
            lease_at: None,
            origin: JobOrigin::Webhook,
            skip_reason: None,
            created_at: now,
        };

        if self.db.insert_job(&job)? {
            tracing::info!(
                entry_id = %event.entry_id,
                user_id = %event.user_id,
                scheduled_at = %job.scheduled_at,
                "Webhook enqueued immediate job"
            );
            Ok(GatewayOutcome::Enqueued { job_id: job.id })
        } else {
            Ok(GatewayOutcome::AlreadyQueued)
        }
    }

    /// Drain the ingress channel until every sender is dropped.
    pub async fn run(&self, events: flume::Receiver<EntryCreatedEvent>) {
        tracing::info!("Webhook gateway listening for entry events");
        while let Ok(event) = events.recv_async().await {
            if let Err(e) = self.on_entry_created(&event, Utc::now()) {
                tracing::warn!(
                    entry_id = %event.entry_id,
                    error = %e,
                    "Webhook gateway failed to process event"
                );
            }
        }
        tracing::info!("Webhook gateway channel closed, stopping");
    }
}
