use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use crate::models::{
    AiResponse, EngagementState, InteractionLevel, JobOrigin, JobState, JournalEntry, Persona,
    ResponseType, SchedulingJob, UserTier,
};

/// Single source of truth for all scheduling state. Every cross-task
/// coordination point (job claim, delivery reservation, delivered uniqueness)
/// is a conditional statement here, so concurrent cycles, the gateway, and
/// restarted runner instances stay consistent without extra locking.
pub struct SchedulerDatabase {
    conn: Mutex<Connection>,
}

/// Outcome of the atomic reserve-and-insert at delivery time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Quota or bombardment predicate no longer holds.
    ReservationLost,
    /// Another runner already delivered this (entry, persona).
    DuplicateResponse,
}

fn parse_ts(idx: usize, raw: &str) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    raw.parse().map_err(|e: chrono::ParseError| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn parse_opt_ts(
    idx: usize,
    raw: Option<String>,
) -> std::result::Result<Option<DateTime<Utc>>, rusqlite::Error> {
    match raw {
        Some(v) => Ok(Some(parse_ts(idx, &v)?)),
        None => Ok(None),
    }
}

fn entry_from_row(row: &Row<'_>) -> std::result::Result<JournalEntry, rusqlite::Error> {
    let created_at: String = row.get(6)?;
    let deleted_at: Option<String> = row.get(8)?;
    Ok(JournalEntry {
        id: row.get(0)?,
        user_id: row.get(1)?,
        content: row.get(2)?,
        mood: row.get(3)?,
        energy: row.get(4)?,
        stress: row.get(5)?,
        created_at: parse_ts(6, &created_at)?,
        is_ai_response: row.get::<_, i64>(7)? != 0,
        deleted_at: parse_opt_ts(8, deleted_at)?,
    })
}

fn response_from_row(row: &Row<'_>) -> std::result::Result<AiResponse, rusqlite::Error> {
    let persona_raw: String = row.get(3)?;
    let response_type_raw: String = row.get(7)?;
    let created_at: String = row.get(10)?;
    Ok(AiResponse {
        id: row.get(0)?,
        journal_entry_id: row.get(1)?,
        user_id: row.get(2)?,
        persona: Persona::from_db(&persona_raw),
        response_text: row.get(4)?,
        parent_id: row.get(5)?,
        conversation_thread_id: row.get(6)?,
        response_type: ResponseType::from_db(&response_type_raw),
        is_ai_response: row.get::<_, i64>(8)? != 0,
        confidence: row.get(9)?,
        created_at: parse_ts(10, &created_at)?,
    })
}

fn job_from_row(row: &Row<'_>) -> std::result::Result<SchedulingJob, rusqlite::Error> {
    let persona_raw: String = row.get(3)?;
    let state_raw: String = row.get(4)?;
    let scheduled_at: String = row.get(5)?;
    let lease_at: Option<String> = row.get(7)?;
    let origin_raw: String = row.get(8)?;
    let created_at: String = row.get(10)?;
    Ok(SchedulingJob {
        id: row.get(0)?,
        journal_entry_id: row.get(1)?,
        user_id: row.get(2)?,
        persona: Persona::from_db(&persona_raw),
        state: JobState::from_db(&state_raw),
        scheduled_at: parse_ts(5, &scheduled_at)?,
        attempt_count: row.get::<_, i64>(6)? as u32,
        lease_at: parse_opt_ts(7, lease_at)?,
        origin: JobOrigin::from_db(&origin_raw),
        skip_reason: row.get(9)?,
        created_at: parse_ts(10, &created_at)?,
    })
}

fn state_from_row(row: &Row<'_>) -> std::result::Result<EngagementState, rusqlite::Error> {
    let last_response_at: Option<String> = row.get(1)?;
    let tier_raw: String = row.get(4)?;
    let level_raw: String = row.get(5)?;
    let last_active_at: Option<String> = row.get(6)?;
    Ok(EngagementState {
        user_id: row.get(0)?,
        last_response_at: parse_opt_ts(1, last_response_at)?,
        daily_response_count: row.get::<_, i64>(2)? as u32,
        count_date: row.get(3)?,
        tier: UserTier::from_db(&tier_raw),
        ai_interaction_level: InteractionLevel::from_db(&level_raw),
        last_active_at: parse_opt_ts(6, last_active_at)?,
    })
}

const JOB_COLUMNS: &str = "id, journal_entry_id, user_id, persona, state, scheduled_at, \
     attempt_count, lease_at, origin, skip_reason, created_at";

const RESPONSE_COLUMNS: &str = "id, journal_entry_id, user_id, persona, response_text, parent_id, \
     conversation_thread_id, response_type, is_ai_response, confidence, created_at";

impl SchedulerDatabase {
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS journal_entries (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                content TEXT NOT NULL,
                mood REAL,
                energy REAL,
                stress REAL,
                created_at TEXT NOT NULL,
                is_ai_response INTEGER NOT NULL DEFAULT 0,
                deleted_at TEXT
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS ai_responses (
                id TEXT PRIMARY KEY,
                journal_entry_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                persona TEXT NOT NULL,
                response_text TEXT NOT NULL,
                parent_id TEXT,
                conversation_thread_id TEXT NOT NULL,
                response_type TEXT NOT NULL,
                is_ai_response INTEGER NOT NULL DEFAULT 1,
                confidence REAL NOT NULL DEFAULT 0.0,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        // One delivered root response per (entry, persona).
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_ai_responses_entry_persona
             ON ai_responses(journal_entry_id, persona)
             WHERE response_type = 'ai_response'",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_ai_responses_thread
             ON ai_responses(conversation_thread_id, created_at)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS user_engagement_state (
                user_id TEXT PRIMARY KEY,
                last_response_at TEXT,
                daily_response_count INTEGER NOT NULL DEFAULT 0,
                count_date TEXT NOT NULL,
                tier TEXT NOT NULL DEFAULT 'free',
                ai_interaction_level TEXT NOT NULL DEFAULT 'balanced',
                last_active_at TEXT
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS scheduling_jobs (
                id TEXT PRIMARY KEY,
                journal_entry_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                persona TEXT NOT NULL,
                state TEXT NOT NULL,
                scheduled_at TEXT NOT NULL,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                lease_at TEXT,
                origin TEXT NOT NULL,
                skip_reason TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        // Root jobs are unique per (entry, persona); follow-up jobs may
        // revisit a pairing that already delivered.
        conn.execute(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_entry_persona
             ON scheduling_jobs(journal_entry_id, persona)
             WHERE origin != 'followup'",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_jobs_due
             ON scheduling_jobs(state, scheduled_at)",
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS analytics_snapshots (
                id TEXT PRIMARY KEY,
                captured_at TEXT NOT NULL,
                delivered INTEGER NOT NULL,
                failed INTEGER NOT NULL,
                skipped INTEGER NOT NULL,
                pending INTEGER NOT NULL,
                failure_reasons_json TEXT NOT NULL,
                avg_delivery_latency_secs REAL
            )"#,
            [],
        )?;

        Ok(())
    }

    // ---- journal entries -------------------------------------------------

    /// Insert an entry. In production this table is written by the user-facing
    /// CRUD path; the core only needs this for the event-ingress mirror and
    /// for tests.
    pub fn insert_journal_entry(&self, entry: &JournalEntry) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO journal_entries
             (id, user_id, content, mood, energy, stress, created_at, is_ai_response, deleted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.id,
                entry.user_id,
                entry.content,
                entry.mood,
                entry.energy,
                entry.stress,
                entry.created_at.to_rfc3339(),
                entry.is_ai_response as i64,
                entry.deleted_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_journal_entry(&self, id: &str) -> Result<Option<JournalEntry>> {
        let conn = self.lock_conn()?;
        let entry = conn
            .query_row(
                "SELECT id, user_id, content, mood, energy, stress, created_at, is_ai_response, deleted_at
                 FROM journal_entries WHERE id = ?1",
                params![id],
                entry_from_row,
            )
            .optional()?;
        Ok(entry)
    }

    /// Recent user-authored entries that no scheduling job references yet.
    /// The sweep predicate is "no jobs at all", which is what makes the main
    /// cycle idempotent: once jobs exist the entry never matches again.
    pub fn entries_without_jobs(&self, since: DateTime<Utc>) -> Result<Vec<JournalEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT e.id, e.user_id, e.content, e.mood, e.energy, e.stress, e.created_at,
                    e.is_ai_response, e.deleted_at
             FROM journal_entries e
             WHERE e.is_ai_response = 0
               AND e.deleted_at IS NULL
               AND e.created_at >= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM scheduling_jobs j WHERE j.journal_entry_id = e.id
               )
             ORDER BY e.created_at ASC",
        )?;
        let entries = stmt
            .query_map(params![since.to_rfc3339()], entry_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // ---- engagement state ------------------------------------------------

    pub fn get_engagement_state(&self, user_id: &str) -> Result<Option<EngagementState>> {
        let conn = self.lock_conn()?;
        let state = conn
            .query_row(
                "SELECT user_id, last_response_at, daily_response_count, count_date, tier,
                        ai_interaction_level, last_active_at
                 FROM user_engagement_state WHERE user_id = ?1",
                params![user_id],
                state_from_row,
            )
            .optional()?;
        Ok(state)
    }

    /// Fetch the user's pacing state, creating a default row on first sight.
    pub fn ensure_engagement_state(&self, user_id: &str, today: &str) -> Result<EngagementState> {
        if let Some(state) = self.get_engagement_state(user_id)? {
            return Ok(state);
        }
        let state = EngagementState::new_for_user(user_id, today);
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO user_engagement_state
             (user_id, last_response_at, daily_response_count, count_date, tier,
              ai_interaction_level, last_active_at)
             VALUES (?1, NULL, 0, ?2, ?3, ?4, NULL)",
            params![
                state.user_id,
                state.count_date,
                state.tier.as_db_str(),
                state.ai_interaction_level.as_db_str(),
            ],
        )?;
        drop(conn);
        Ok(self
            .get_engagement_state(user_id)?
            .unwrap_or(state))
    }

    pub fn set_user_tier(
        &self,
        user_id: &str,
        tier: UserTier,
        level: InteractionLevel,
        today: &str,
    ) -> Result<()> {
        self.ensure_engagement_state(user_id, today)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE user_engagement_state SET tier = ?2, ai_interaction_level = ?3 WHERE user_id = ?1",
            params![user_id, tier.as_db_str(), level.as_db_str()],
        )?;
        Ok(())
    }

    pub fn touch_last_active(&self, user_id: &str, at: DateTime<Utc>, today: &str) -> Result<()> {
        self.ensure_engagement_state(user_id, today)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE user_engagement_state SET last_active_at = ?2 WHERE user_id = ?1",
            params![user_id, at.to_rfc3339()],
        )?;
        Ok(())
    }

    // ---- scheduling jobs -------------------------------------------------

    /// Insert a PENDING job. Returns false when a job for this
    /// (entry, persona) already exists; the unique index makes duplicate
    /// proposals from concurrent producers a no-op.
    pub fn insert_job(&self, job: &SchedulingJob) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO scheduling_jobs
             (id, journal_entry_id, user_id, persona, state, scheduled_at, attempt_count,
              lease_at, origin, skip_reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                job.id,
                job.journal_entry_id,
                job.user_id,
                job.persona.as_db_str(),
                job.state.as_db_str(),
                job.scheduled_at.to_rfc3339(),
                job.attempt_count as i64,
                job.lease_at.map(|t| t.to_rfc3339()),
                job.origin.as_db_str(),
                job.skip_reason,
                job.created_at.to_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<SchedulingJob>> {
        let conn = self.lock_conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM scheduling_jobs WHERE id = ?1"),
                params![id],
                job_from_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Due PENDING jobs. When `active_within_hours` is set, only jobs for
    /// users active within that window are returned (the immediate cycle's
    /// low-latency slice).
    pub fn due_pending_jobs(
        &self,
        now: DateTime<Utc>,
        active_within_hours: Option<u32>,
        limit: usize,
    ) -> Result<Vec<SchedulingJob>> {
        let conn = self.lock_conn()?;
        let jobs = match active_within_hours {
            Some(hours) => {
                let cutoff = now - chrono::Duration::hours(hours as i64);
                let mut stmt = conn.prepare(
                    "SELECT j.id, j.journal_entry_id, j.user_id, j.persona, j.state,
                            j.scheduled_at, j.attempt_count, j.lease_at, j.origin,
                            j.skip_reason, j.created_at
                     FROM scheduling_jobs j
                     JOIN user_engagement_state s ON s.user_id = j.user_id
                     WHERE j.state = 'pending' AND j.scheduled_at <= ?1
                       AND s.last_active_at IS NOT NULL AND s.last_active_at >= ?2
                     ORDER BY j.scheduled_at ASC LIMIT ?3",
                )?;
                let rows = stmt
                    .query_map(
                        params![now.to_rfc3339(), cutoff.to_rfc3339(), limit as i64],
                        job_from_row,
                    )?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {JOB_COLUMNS} FROM scheduling_jobs
                     WHERE state = 'pending' AND scheduled_at <= ?1
                     ORDER BY scheduled_at ASC LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![now.to_rfc3339(), limit as i64], job_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(jobs)
    }

    /// Atomic PENDING -> GENERATING transition. Only one caller wins; the
    /// attempt counter and lease are set in the same statement.
    pub fn claim_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE scheduling_jobs
             SET state = 'generating', lease_at = ?2, attempt_count = attempt_count + 1
             WHERE id = ?1 AND state = 'pending'",
            params![job_id, now.to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    /// GENERATING -> PENDING with a later scheduled_at, after a retryable
    /// collaborator failure.
    pub fn reschedule_failed_job(&self, job_id: &str, next_at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE scheduling_jobs
             SET state = 'pending', lease_at = NULL, scheduled_at = ?2
             WHERE id = ?1 AND state = 'generating'",
            params![job_id, next_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn skip_job(&self, job_id: &str, reason: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE scheduling_jobs
             SET state = 'skipped', lease_at = NULL, skip_reason = ?2
             WHERE id = ?1 AND state IN ('pending', 'generating')",
            params![job_id, reason],
        )?;
        Ok(())
    }

    /// Atomic delivery: reserve the user's pacing budget, insert the response
    /// row, and mark the job DELIVERED in one transaction. Rolls back with a
    /// non-Delivered outcome when a concurrent delivery got there first.
    pub fn deliver_response(
        &self,
        job_id: &str,
        response: &AiResponse,
        window_secs: i64,
        daily_cap: u32,
        today: &str,
        bypass_window: bool,
    ) -> Result<DeliveryOutcome> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let now = response.created_at;
        let cutoff = now - chrono::Duration::seconds(window_secs);

        let reserved = tx.execute(
            "UPDATE user_engagement_state
             SET last_response_at = ?2,
                 daily_response_count = CASE WHEN count_date = ?3
                     THEN daily_response_count + 1 ELSE 1 END,
                 count_date = ?3
             WHERE user_id = ?1
               AND (CASE WHEN count_date = ?3 THEN daily_response_count ELSE 0 END) < ?4
               AND (?5 OR last_response_at IS NULL OR last_response_at <= ?6)",
            params![
                response.user_id,
                now.to_rfc3339(),
                today,
                daily_cap as i64,
                bypass_window as i64,
                cutoff.to_rfc3339(),
            ],
        )?;
        if reserved == 0 {
            return Ok(DeliveryOutcome::ReservationLost);
        }

        let inserted = tx.execute(
            &format!(
                "INSERT OR IGNORE INTO ai_responses ({RESPONSE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                response.id,
                response.journal_entry_id,
                response.user_id,
                response.persona.as_db_str(),
                response.response_text,
                response.parent_id,
                response.conversation_thread_id,
                response.response_type.as_db_str(),
                response.is_ai_response as i64,
                response.confidence,
                response.created_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            // Unique (entry, persona) already satisfied by another runner.
            return Ok(DeliveryOutcome::DuplicateResponse);
        }

        tx.execute(
            "UPDATE scheduling_jobs SET state = 'delivered', lease_at = ?2 WHERE id = ?1",
            params![job_id, now.to_rfc3339()],
        )?;

        tx.commit()?;
        Ok(DeliveryOutcome::Delivered)
    }

    // ---- responses / threads ---------------------------------------------

    /// Raw append used by the thread store (user replies and validation-passed
    /// rows outside the delivery transaction). Returns false when the unique
    /// (entry, persona) index rejects the row.
    pub fn insert_response(&self, response: &AiResponse) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO ai_responses ({RESPONSE_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            params![
                response.id,
                response.journal_entry_id,
                response.user_id,
                response.persona.as_db_str(),
                response.response_text,
                response.parent_id,
                response.conversation_thread_id,
                response.response_type.as_db_str(),
                response.is_ai_response as i64,
                response.confidence,
                response.created_at.to_rfc3339(),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_response(&self, id: &str) -> Result<Option<AiResponse>> {
        let conn = self.lock_conn()?;
        let response = conn
            .query_row(
                &format!("SELECT {RESPONSE_COLUMNS} FROM ai_responses WHERE id = ?1"),
                params![id],
                response_from_row,
            )
            .optional()?;
        Ok(response)
    }

    pub fn thread_rows_for_entry(&self, entry_id: &str) -> Result<Vec<AiResponse>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESPONSE_COLUMNS} FROM ai_responses
             WHERE journal_entry_id = ?1
             ORDER BY created_at ASC, id ASC"
        ))?;
        let rows = stmt
            .query_map(params![entry_id], response_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn thread_id_for_entry(&self, entry_id: &str) -> Result<Option<String>> {
        let conn = self.lock_conn()?;
        let thread_id = conn
            .query_row(
                "SELECT conversation_thread_id FROM ai_responses
                 WHERE journal_entry_id = ?1 ORDER BY created_at ASC LIMIT 1",
                params![entry_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(thread_id)
    }

    /// Personas that already hold a root response on this entry.
    pub fn personas_responded(&self, entry_id: &str) -> Result<Vec<Persona>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT persona FROM ai_responses
             WHERE journal_entry_id = ?1 AND response_type = 'ai_response'",
        )?;
        let personas = stmt
            .query_map(params![entry_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?
            .iter()
            .map(|raw| Persona::from_db(raw))
            .collect();
        Ok(personas)
    }

    /// User replies that have no AI follow-up yet and no follow-up job. Feeds
    /// the main cycle's follow-up planner.
    pub fn unanswered_user_replies(&self, since: DateTime<Utc>) -> Result<Vec<AiResponse>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {RESPONSE_COLUMNS} FROM ai_responses r
             WHERE r.response_type = 'user_reply'
               AND r.created_at >= ?1
               AND NOT EXISTS (
                   SELECT 1 FROM ai_responses c
                   WHERE c.parent_id = r.id AND c.response_type = 'ai_followup'
               )
               AND NOT EXISTS (
                   SELECT 1 FROM scheduling_jobs j
                   WHERE j.journal_entry_id = r.journal_entry_id
                     AND j.origin = 'followup'
                     AND j.created_at >= r.created_at
               )
             ORDER BY r.created_at ASC"
        ))?;
        let rows = stmt
            .query_map(params![since.to_rfc3339()], response_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- cleanup ----------------------------------------------------------

    /// PENDING jobs scheduled before the cutoff become SKIPPED.
    pub fn expire_pending_jobs(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE scheduling_jobs
             SET state = 'skipped', skip_reason = 'ttl_expired'
             WHERE state = 'pending' AND scheduled_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(changed)
    }

    /// GENERATING jobs whose lease expired go back to PENDING so a restarted
    /// runner can pick them up.
    pub fn release_expired_leases(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE scheduling_jobs
             SET state = 'pending', lease_at = NULL
             WHERE state = 'generating' AND (lease_at IS NULL OR lease_at < ?1)",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(changed)
    }

    /// Zero daily counts whose count_date is not today.
    pub fn reset_stale_daily_counts(&self, today: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE user_engagement_state
             SET daily_response_count = 0, count_date = ?1
             WHERE count_date != ?1",
            params![today],
        )?;
        Ok(changed)
    }

    // ---- analytics --------------------------------------------------------

    pub fn job_state_counts(&self) -> Result<HashMap<JobState, u64>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT state, COUNT(*) FROM scheduling_jobs GROUP BY state")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(state, count)| (JobState::from_db(&state), count as u64))
            .collect())
    }

    pub fn skip_reason_counts(&self) -> Result<HashMap<String, u64>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT skip_reason, COUNT(*) FROM scheduling_jobs
             WHERE state = 'skipped' AND skip_reason IS NOT NULL
             GROUP BY skip_reason",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows
            .into_iter()
            .map(|(reason, count)| (reason, count as u64))
            .collect())
    }

    /// Mean seconds between scheduled_at and delivery, over delivered jobs.
    /// Delivered jobs reuse lease_at as the delivery timestamp.
    pub fn avg_delivery_latency_secs(&self) -> Result<Option<f64>> {
        let conn = self.lock_conn()?;
        let avg: Option<f64> = conn.query_row(
            "SELECT AVG((julianday(lease_at) - julianday(scheduled_at)) * 86400.0)
             FROM scheduling_jobs
             WHERE state = 'delivered' AND lease_at IS NOT NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(avg)
    }

    pub fn insert_analytics_snapshot(
        &self,
        id: &str,
        captured_at: DateTime<Utc>,
        delivered: u64,
        failed: u64,
        skipped: u64,
        pending: u64,
        failure_reasons_json: &str,
        avg_latency_secs: Option<f64>,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO analytics_snapshots
             (id, captured_at, delivered, failed, skipped, pending, failure_reasons_json,
              avg_delivery_latency_secs)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id,
                captured_at.to_rfc3339(),
                delivered as i64,
                failed as i64,
                skipped as i64,
                pending as i64,
                failure_reasons_json,
                avg_latency_secs,
            ],
        )?;
        Ok(())
    }

    pub fn prune_analytics(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "DELETE FROM analytics_snapshots WHERE captured_at < ?1",
            params![cutoff.to_rfc3339()],
        )?;
        Ok(changed)
    }

    pub fn analytics_snapshot_count(&self) -> Result<u64> {
        let conn = self.lock_conn()?;
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM analytics_snapshots", [], |row| {
                row.get(0)
            })?;
        Ok(count as u64)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn local_today() -> String {
        chrono::Local::now().format("%Y-%m-%d").to_string()
    }

    #[test]
    fn duplicate_job_insert_is_ignored() {
        let db = SchedulerDatabase::new(temp_db_path("dup_job")).expect("db init");
        let entry = sample_entry("u1", "Long enough journal entry content.");
        db.insert_journal_entry(&entry).expect("insert entry");

        let job = sample_job(&entry, Persona::Pulse);
        assert!(db.insert_job(&job).expect("first insert"));

        let mut dup = sample_job(&entry, Persona::Pulse);
        dup.id = uuid::Uuid::new_v4().to_string();
        assert!(!db.insert_job(&dup).expect("second insert"));

        // A different persona on the same entry is fine.
        let other = sample_job(&entry, Persona::Sage);
        assert!(db.insert_job(&other).expect("other persona"));
    }

    #[test]
    fn claim_job_is_single_winner() {
        let db = SchedulerDatabase::new(temp_db_path("claim")).expect("db init");
        let entry = sample_entry("u1", "Long enough journal entry content.");
        let job = sample_job(&entry, Persona::Pulse);
        db.insert_job(&job).expect("insert");

        let now = Utc::now();
        assert!(db.claim_job(&job.id, now).expect("first claim"));
        assert!(!db.claim_job(&job.id, now).expect("second claim"));

        let claimed = db.get_job(&job.id).expect("get").expect("exists");
        assert_eq!(claimed.state, JobState::Generating);
        assert_eq!(claimed.attempt_count, 1);
        assert!(claimed.lease_at.is_some());
    }

    #[test]
    fn job_state_counts_are_keyed_by_state() {
        let db = SchedulerDatabase::new(temp_db_path("state_counts")).expect("db init");
        let entry = sample_entry("u1", "Long enough journal entry content.");
        db.insert_job(&sample_job(&entry, Persona::Pulse)).expect("pending");

        let entry2 = sample_entry("u2", "Another long enough journal entry.");
        let skipped = sample_job(&entry2, Persona::Sage);
        db.insert_job(&skipped).expect("job");
        db.skip_job(&skipped.id, "quota_exhausted").expect("skip");

        let counts = db.job_state_counts().expect("counts");
        assert_eq!(counts.get(&JobState::Pending), Some(&1));
        assert_eq!(counts.get(&JobState::Skipped), Some(&1));
        assert_eq!(counts.get(&JobState::Delivered), None);
    }

    #[test]
    fn due_jobs_can_be_filtered_to_recently_active_users() {
        let db = SchedulerDatabase::new(temp_db_path("due_active")).expect("db init");
        let now = Utc::now();
        let today = local_today();

        db.touch_last_active("active", now, &today).expect("active");
        db.ensure_engagement_state("idle", &today).expect("idle");

        let entry_a = sample_entry("active", "Long enough journal entry content.");
        db.insert_job(&sample_job(&entry_a, Persona::Pulse)).expect("job a");
        let entry_b = sample_entry("idle", "Another long enough journal entry.");
        db.insert_job(&sample_job(&entry_b, Persona::Sage)).expect("job b");

        let later = now + ChronoDuration::minutes(1);
        assert_eq!(db.due_pending_jobs(later, None, 10).expect("all").len(), 2);

        let active_only = db.due_pending_jobs(later, Some(24), 10).expect("filtered");
        assert_eq!(active_only.len(), 1);
        assert_eq!(active_only[0].user_id, "active");
    }

    #[test]
    fn delivery_reserves_quota_and_rejects_over_cap() {
        let db = SchedulerDatabase::new(temp_db_path("deliver")).expect("db init");
        let today = local_today();
        db.ensure_engagement_state("u1", &today).expect("state");

        let entry = sample_entry("u1", "Long enough journal entry content.");
        db.insert_journal_entry(&entry).expect("entry");
        let job = sample_job(&entry, Persona::Pulse);
        db.insert_job(&job).expect("job");
        db.claim_job(&job.id, Utc::now()).expect("claim");

        let thread_id = uuid::Uuid::new_v4().to_string();
        let response = sample_response(&entry, Persona::Pulse, &thread_id, ResponseType::AiResponse);
        let outcome = db
            .deliver_response(&job.id, &response, 0, 2, &today, false)
            .expect("deliver");
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        let state = db.get_engagement_state("u1").expect("get").expect("state");
        assert_eq!(state.daily_response_count, 1);
        assert!(state.last_response_at.is_some());

        // Second delivery for the same persona loses to the unique index.
        let entry2 = sample_entry("u1", "Another long enough journal entry.");
        db.insert_journal_entry(&entry2).expect("entry2");
        let job2 = sample_job(&entry2, Persona::Pulse);
        db.insert_job(&job2).expect("job2");
        db.claim_job(&job2.id, Utc::now()).expect("claim2");
        let mut dup = sample_response(&entry, Persona::Pulse, &thread_id, ResponseType::AiResponse);
        dup.id = uuid::Uuid::new_v4().to_string();
        let outcome = db
            .deliver_response(&job2.id, &dup, 0, 2, &today, false)
            .expect("deliver dup");
        assert_eq!(outcome, DeliveryOutcome::DuplicateResponse);

        // A delivery past the cap loses the reservation.
        let response2 =
            sample_response(&entry2, Persona::Pulse, &uuid::Uuid::new_v4().to_string(),
                ResponseType::AiResponse);
        let outcome = db
            .deliver_response(&job2.id, &response2, 0, 1, &today, false)
            .expect("deliver capped");
        assert_eq!(outcome, DeliveryOutcome::ReservationLost);
    }

    #[test]
    fn bombardment_predicate_blocks_close_deliveries_unless_bypassed() {
        let db = SchedulerDatabase::new(temp_db_path("window")).expect("db init");
        let today = local_today();
        db.ensure_engagement_state("u1", &today).expect("state");

        let entry = sample_entry("u1", "Long enough journal entry content.");
        let job = sample_job(&entry, Persona::Pulse);
        db.insert_job(&job).expect("job");
        db.claim_job(&job.id, Utc::now()).expect("claim");
        let response = sample_response(
            &entry,
            Persona::Pulse,
            &uuid::Uuid::new_v4().to_string(),
            ResponseType::AiResponse,
        );
        let window = 3600;
        assert_eq!(
            db.deliver_response(&job.id, &response, window, 10, &today, false)
                .expect("first"),
            DeliveryOutcome::Delivered
        );

        let entry2 = sample_entry("u1", "Another long enough journal entry.");
        let job2 = sample_job(&entry2, Persona::Sage);
        db.insert_job(&job2).expect("job2");
        db.claim_job(&job2.id, Utc::now()).expect("claim2");
        let blocked = sample_response(
            &entry2,
            Persona::Sage,
            &uuid::Uuid::new_v4().to_string(),
            ResponseType::AiResponse,
        );
        assert_eq!(
            db.deliver_response(&job2.id, &blocked, window, 10, &today, false)
                .expect("blocked"),
            DeliveryOutcome::ReservationLost
        );

        // A follow-up triggered by an explicit user reply bypasses the window.
        let mut followup = blocked.clone();
        followup.id = uuid::Uuid::new_v4().to_string();
        followup.response_type = ResponseType::AiFollowup;
        assert_eq!(
            db.deliver_response(&job2.id, &followup, window, 10, &today, true)
                .expect("followup"),
            DeliveryOutcome::Delivered
        );
    }

    #[test]
    fn sweep_scan_skips_entries_with_jobs_and_ai_entries() {
        let db = SchedulerDatabase::new(temp_db_path("sweep")).expect("db init");
        let since = Utc::now() - ChronoDuration::hours(1);

        let fresh = sample_entry("u1", "A fresh entry with no jobs yet.");
        db.insert_journal_entry(&fresh).expect("fresh");

        let mut ai_entry = sample_entry("u1", "An entry the AI itself wrote earlier.");
        ai_entry.is_ai_response = true;
        db.insert_journal_entry(&ai_entry).expect("ai entry");

        let covered = sample_entry("u2", "Entry that already has a pending job.");
        db.insert_journal_entry(&covered).expect("covered");
        db.insert_job(&sample_job(&covered, Persona::Pulse))
            .expect("job");

        let scanned = db.entries_without_jobs(since).expect("scan");
        let ids: Vec<&str> = scanned.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![fresh.id.as_str()]);
    }

    #[test]
    fn cleanup_expires_ttl_releases_leases_and_resets_counts() {
        let db = SchedulerDatabase::new(temp_db_path("cleanup")).expect("db init");
        let now = Utc::now();

        let entry = sample_entry("u1", "Long enough journal entry content.");
        let mut stale = sample_job(&entry, Persona::Pulse);
        stale.scheduled_at = now - ChronoDuration::hours(30);
        db.insert_job(&stale).expect("stale job");

        let entry2 = sample_entry("u1", "Another long enough journal entry.");
        let stuck = sample_job(&entry2, Persona::Sage);
        db.insert_job(&stuck).expect("stuck job");
        db.claim_job(&stuck.id, now - ChronoDuration::minutes(10))
            .expect("claim");

        assert_eq!(
            db.expire_pending_jobs(now - ChronoDuration::hours(24))
                .expect("expire"),
            1
        );
        let expired = db.get_job(&stale.id).expect("get").expect("exists");
        assert_eq!(expired.state, JobState::Skipped);
        assert_eq!(expired.skip_reason.as_deref(), Some("ttl_expired"));

        assert_eq!(
            db.release_expired_leases(now - ChronoDuration::minutes(5))
                .expect("release"),
            1
        );
        let released = db.get_job(&stuck.id).expect("get").expect("exists");
        assert_eq!(released.state, JobState::Pending);
        assert!(released.lease_at.is_none());

        db.ensure_engagement_state("u1", "2026-08-24").expect("state");
        assert_eq!(db.reset_stale_daily_counts("2026-08-25").expect("reset"), 1);
        let state = db.get_engagement_state("u1").expect("get").expect("state");
        assert_eq!(state.daily_response_count, 0);
        assert_eq!(state.count_date, "2026-08-25");
    }

    #[test]
    fn thread_rows_come_back_in_created_at_order() {
        let db = SchedulerDatabase::new(temp_db_path("thread_order")).expect("db init");
        let entry = sample_entry("u1", "Long enough journal entry content.");
        let thread_id = uuid::Uuid::new_v4().to_string();

        let mut first = sample_response(&entry, Persona::Pulse, &thread_id, ResponseType::AiResponse);
        first.created_at = Utc::now() - ChronoDuration::minutes(10);
        let mut reply = sample_response(&entry, Persona::Pulse, &thread_id, ResponseType::UserReply);
        reply.parent_id = Some(first.id.clone());
        reply.created_at = Utc::now() - ChronoDuration::minutes(5);
        let mut followup =
            sample_response(&entry, Persona::Pulse, &thread_id, ResponseType::AiFollowup);
        followup.parent_id = Some(reply.id.clone());

        // Insert out of order on purpose.
        assert!(db.insert_response(&followup).expect("followup"));
        assert!(db.insert_response(&first).expect("first"));
        assert!(db.insert_response(&reply).expect("reply"));

        let rows = db.thread_rows_for_entry(&entry.id).expect("read");
        assert_eq!(rows.len(), 3);
        assert!(rows.windows(2).all(|w| w[0].created_at <= w[1].created_at));
        assert_eq!(rows[0].id, first.id);
    }

    #[test]
    fn unanswered_replies_surface_until_followed_up() {
        let db = SchedulerDatabase::new(temp_db_path("replies")).expect("db init");
        let since = Utc::now() - ChronoDuration::hours(1);
        let entry = sample_entry("u1", "Long enough journal entry content.");
        let thread_id = uuid::Uuid::new_v4().to_string();

        let root = sample_response(&entry, Persona::Pulse, &thread_id, ResponseType::AiResponse);
        db.insert_response(&root).expect("root");
        let mut reply = sample_response(&entry, Persona::Pulse, &thread_id, ResponseType::UserReply);
        reply.parent_id = Some(root.id.clone());
        db.insert_response(&reply).expect("reply");

        let open = db.unanswered_user_replies(since).expect("scan");
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, reply.id);

        let mut followup =
            sample_response(&entry, Persona::Pulse, &thread_id, ResponseType::AiFollowup);
        followup.parent_id = Some(reply.id.clone());
        db.insert_response(&followup).expect("followup");

        assert!(db.unanswered_user_replies(since).expect("scan").is_empty());
    }
}
