use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Local, Utc};
use rand::Rng;
use std::sync::Arc;

use crate::config::SchedulerConfig;
use crate::database::{DeliveryOutcome, SchedulerDatabase};
use crate::generation::{GenerationError, ResponseGenerator};
use crate::models::{
    JobOrigin, JobState, JournalEntry, Persona, ResponseType, SchedulingJob,
};
use crate::personas::{detect_topics, PersonaSelector};
use crate::policy::{EngagementDecision, EngagementPolicy, PolicyTrigger};
use crate::thread_store::{NewResponse, ThreadStore};

/// Entries older than this at execution time count as proactive follow-ups
/// and become subject to the user-activity check.
const PROACTIVE_ENTRY_AGE_HOURS: i64 = 24;

/// How much thread history the collaborator sees.
const HISTORY_LIMIT: usize = 10;

/// Final word on one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered,
    Skipped(String),
    /// Retryable collaborator failure; the job went back to PENDING.
    Rescheduled,
    /// Another runner claimed the job first.
    NotClaimed,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchStats {
    pub processed: usize,
    pub delivered: usize,
    pub skipped: usize,
    pub rescheduled: usize,
    pub errors: usize,
}

/// Drives approved (entry, persona) pairings through
/// PENDING -> GENERATING -> DELIVERED, re-validating policy at execution time
/// and writing results through the thread store. The only component that
/// moves a job out of PENDING during normal operation.
pub struct ResponseOrchestrator {
    db: Arc<SchedulerDatabase>,
    threads: ThreadStore,
    policy: EngagementPolicy,
    selector: PersonaSelector,
    generator: Arc<dyn ResponseGenerator>,
    config: SchedulerConfig,
}

fn local_day(now: DateTime<Utc>) -> String {
    now.with_timezone(&Local).format("%Y-%m-%d").to_string()
}

impl ResponseOrchestrator {
    pub fn new(
        db: Arc<SchedulerDatabase>,
        generator: Arc<dyn ResponseGenerator>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            threads: ThreadStore::new(db.clone()),
            policy: EngagementPolicy::from_config(&config),
            selector: PersonaSelector::from_config(&config),
            db,
            generator,
            config,
        }
    }

    pub fn database(&self) -> Arc<SchedulerDatabase> {
        self.db.clone()
    }

    // ---- scheduling ------------------------------------------------------

    /// Policy + selection for one entry; approved pairings become PENDING
    /// jobs. Returns how many jobs were actually created (duplicates from
    /// concurrent producers collapse in the store).
    pub fn plan_jobs_for_entry(
        &self,
        entry: &JournalEntry,
        origin: JobOrigin,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let today = local_day(now);
        let state = self.db.ensure_engagement_state(&entry.user_id, &today)?;
        let decision = self
            .policy
            .evaluate(entry, &state, PolicyTrigger::NewEntry, now, &today);
        if let EngagementDecision::Ineligible(reason) = decision {
            tracing::debug!(
                user_id = %entry.user_id,
                entry_id = %entry.id,
                reason = reason.as_str(),
                "Entry not eligible for scheduling"
            );
            return Ok(0);
        }

        let topics = detect_topics(entry);
        let already = self.db.personas_responded(&entry.id)?;
        let picks = self.selector.select(entry, &topics, &already, state.tier);

        let mut created = 0;
        let mut base = now + self.delivery_jitter(origin);
        for pick in picks {
            base = base + pick.target_delay;
            let job = SchedulingJob {
                id: uuid::Uuid::new_v4().to_string(),
                journal_entry_id: entry.id.clone(),
                user_id: entry.user_id.clone(),
                persona: pick.persona,
                state: JobState::Pending,
                scheduled_at: base,
                attempt_count: 0,
                lease_at: None,
                origin,
                skip_reason: None,
                created_at: now,
            };
            if self.db.insert_job(&job)? {
                created += 1;
                tracing::info!(
                    entry_id = %entry.id,
                    persona = pick.persona.as_db_str(),
                    scheduled_at = %job.scheduled_at,
                    "Scheduled response job"
                );
            }
        }
        Ok(created)
    }

    /// One follow-up job per unanswered user reply, addressed to the persona
    /// the user replied to.
    pub fn plan_followup_jobs(&self, now: DateTime<Utc>) -> Result<usize> {
        let since = now - ChronoDuration::hours(self.config.sweep_lookback_hours as i64);
        let mut created = 0;
        for reply in self.db.unanswered_user_replies(since)? {
            let job = SchedulingJob {
                id: uuid::Uuid::new_v4().to_string(),
                journal_entry_id: reply.journal_entry_id.clone(),
                user_id: reply.user_id.clone(),
                persona: reply.persona,
                state: JobState::Pending,
                scheduled_at: now + self.delivery_jitter(JobOrigin::Followup),
                attempt_count: 0,
                lease_at: None,
                origin: JobOrigin::Followup,
                skip_reason: None,
                created_at: now,
            };
            if self.db.insert_job(&job)? {
                created += 1;
                tracing::info!(
                    entry_id = %reply.journal_entry_id,
                    persona = reply.persona.as_db_str(),
                    "Scheduled follow-up job for user reply"
                );
            }
        }
        Ok(created)
    }

    fn delivery_jitter(&self, origin: JobOrigin) -> ChronoDuration {
        let mut rng = rand::thread_rng();
        match origin {
            JobOrigin::Webhook | JobOrigin::Followup => ChronoDuration::minutes(rng.gen_range(
                self.config.immediate_jitter_min_mins as i64
                    ..=self.config.immediate_jitter_max_mins as i64,
            )),
            JobOrigin::Sweep => ChronoDuration::minutes(
                rng.gen_range(0..=(self.config.sweep_window_hours as i64 * 60)),
            ),
        }
    }

    // ---- execution -------------------------------------------------------

    /// Execute every due PENDING job. One job's failure never aborts the
    /// rest of the batch.
    pub async fn run_due_jobs(
        &self,
        now: DateTime<Utc>,
        active_within_hours: Option<u32>,
        limit: usize,
    ) -> Result<BatchStats> {
        let jobs = self.db.due_pending_jobs(now, active_within_hours, limit)?;
        let mut stats = BatchStats::default();
        for job in jobs {
            stats.processed += 1;
            match self.execute_job(&job, now).await {
                Ok(JobOutcome::Delivered) => stats.delivered += 1,
                Ok(JobOutcome::Skipped(_)) => stats.skipped += 1,
                Ok(JobOutcome::Rescheduled) => stats.rescheduled += 1,
                Ok(JobOutcome::NotClaimed) => {}
                Err(e) => {
                    stats.errors += 1;
                    tracing::warn!(
                        job_id = %job.id,
                        user_id = %job.user_id,
                        error = %e,
                        "Job execution failed; continuing batch"
                    );
                }
            }
        }
        Ok(stats)
    }

    /// The state machine for one job. The only await point is the
    /// collaborator call; store round-trips are short synchronous statements.
    pub async fn execute_job(&self, job: &SchedulingJob, now: DateTime<Utc>) -> Result<JobOutcome> {
        if !self.db.claim_job(&job.id, now)? {
            return Ok(JobOutcome::NotClaimed);
        }

        let today = local_day(now);
        let entry = match self.db.get_journal_entry(&job.journal_entry_id)? {
            Some(entry) if entry.deleted_at.is_none() => entry,
            Some(_) => {
                self.db.skip_job(&job.id, "entry_deleted")?;
                return Ok(JobOutcome::Skipped("entry_deleted".to_string()));
            }
            None => {
                self.db.skip_job(&job.id, "entry_missing")?;
                return Ok(JobOutcome::Skipped("entry_missing".to_string()));
            }
        };

        // Policy is re-validated at execution time; the scheduling-time
        // verdict may have been invalidated by concurrent deliveries.
        let state = self.db.ensure_engagement_state(&job.user_id, &today)?;
        let trigger = execution_trigger(job, &entry, now);
        if let EngagementDecision::Ineligible(reason) =
            self.policy.evaluate(&entry, &state, trigger, now, &today)
        {
            self.db.skip_job(&job.id, reason.as_str())?;
            tracing::info!(
                job_id = %job.id,
                reason = reason.as_str(),
                "Job skipped on execution-time policy re-check"
            );
            return Ok(JobOutcome::Skipped(reason.as_str().to_string()));
        }

        if job.origin != JobOrigin::Followup
            && self.db.personas_responded(&entry.id)?.contains(&job.persona)
        {
            self.db.skip_job(&job.id, "duplicate_persona")?;
            return Ok(JobOutcome::Skipped("duplicate_persona".to_string()));
        }

        let history = self
            .threads
            .history_for_generation(&entry.id, &entry.content, HISTORY_LIMIT)?;

        let generated = tokio::time::timeout(
            std::time::Duration::from_secs(self.config.generation_timeout_secs),
            self.generator.generate(&entry.content, job.persona, &history),
        )
        .await
        .unwrap_or(Err(GenerationError::Timeout));

        match generated {
            Ok(response) => self.deliver(job, &entry, trigger, response.text, response.confidence, now),
            Err(error) => self.handle_generation_failure(job, error, now),
        }
    }

    fn deliver(
        &self,
        job: &SchedulingJob,
        entry: &JournalEntry,
        trigger: PolicyTrigger,
        text: String,
        confidence: f64,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome> {
        let is_followup = job.origin == JobOrigin::Followup;
        let parent_id = if is_followup {
            self.latest_user_reply(&entry.id, job.persona)?
        } else {
            None
        };
        let new = NewResponse {
            journal_entry_id: entry.id.clone(),
            user_id: entry.user_id.clone(),
            persona: job.persona,
            response_text: text,
            parent_id,
            response_type: if is_followup {
                ResponseType::AiFollowup
            } else {
                ResponseType::AiResponse
            },
            confidence,
        };
        let row = self.threads.prepare(&new, now)?;

        let state = self
            .db
            .get_engagement_state(&entry.user_id)?
            .context("Engagement state vanished during delivery")?;
        let today = local_day(now);
        let outcome = self.db.deliver_response(
            &job.id,
            &row,
            self.config.bombardment_window_secs(),
            state.effective_daily_cap(),
            &today,
            trigger == PolicyTrigger::UserReplyFollowup,
        )?;

        match outcome {
            DeliveryOutcome::Delivered => {
                tracing::info!(
                    job_id = %job.id,
                    user_id = %entry.user_id,
                    persona = job.persona.as_db_str(),
                    thread_id = %row.conversation_thread_id,
                    "Response delivered"
                );
                Ok(JobOutcome::Delivered)
            }
            DeliveryOutcome::ReservationLost => {
                self.db.skip_job(&job.id, "reservation_lost")?;
                Ok(JobOutcome::Skipped("reservation_lost".to_string()))
            }
            DeliveryOutcome::DuplicateResponse => {
                self.db.skip_job(&job.id, "duplicate_persona")?;
                Ok(JobOutcome::Skipped("duplicate_persona".to_string()))
            }
        }
    }

    fn handle_generation_failure(
        &self,
        job: &SchedulingJob,
        error: GenerationError,
        now: DateTime<Utc>,
    ) -> Result<JobOutcome> {
        // attempt_count was bumped by the claim.
        let attempts = job.attempt_count + 1;
        if attempts >= self.config.max_attempts {
            self.db.skip_job(&job.id, error.as_reason())?;
            tracing::warn!(
                job_id = %job.id,
                attempts,
                reason = error.as_reason(),
                "Job abandoned after exhausting retries"
            );
            return Ok(JobOutcome::Skipped(error.as_reason().to_string()));
        }

        let backoff_secs = self.config.backoff_base_secs * 2u64.pow(attempts.saturating_sub(1));
        let next_at = now + ChronoDuration::seconds(backoff_secs as i64);
        self.db.reschedule_failed_job(&job.id, next_at)?;
        tracing::info!(
            job_id = %job.id,
            attempts,
            next_at = %next_at,
            error = %error,
            "Generation failed; job rescheduled with backoff"
        );
        Ok(JobOutcome::Rescheduled)
    }

    fn latest_user_reply(&self, entry_id: &str, persona: Persona) -> Result<Option<String>> {
        let rows = self.threads.read_thread(entry_id)?;
        Ok(rows
            .iter()
            .rev()
            .find(|row| row.response_type == ResponseType::UserReply && row.persona == persona)
            .or_else(|| {
                rows.iter()
                    .rev()
                    .find(|row| row.response_type == ResponseType::UserReply)
            })
            .map(|row| row.id.clone()))
    }
}

fn execution_trigger(job: &SchedulingJob, entry: &JournalEntry, now: DateTime<Utc>) -> PolicyTrigger {
    if job.origin == JobOrigin::Followup {
        return PolicyTrigger::UserReplyFollowup;
    }
    if (now - entry.created_at).num_hours() >= PROACTIVE_ENTRY_AGE_HOURS {
        PolicyTrigger::SweepFollowup
    } else {
        PolicyTrigger::NewEntry
    }
}
