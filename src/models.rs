use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A user's journal entry as seen by the scheduling core. Written by the
/// user-facing CRUD path; the core never mutates one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub user_id: String,
    pub content: String,
    pub mood: Option<f32>,
    pub energy: Option<f32>,
    pub stress: Option<f32>,
    pub created_at: DateTime<Utc>,
    pub is_ai_response: bool,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A named response voice. A presentation identity, not a distinct model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Persona {
    Pulse,
    Sage,
    Spark,
    Haven,
}

impl Persona {
    pub const ALL: [Persona; 4] = [
        Persona::Pulse,
        Persona::Sage,
        Persona::Spark,
        Persona::Haven,
    ];

    pub fn as_db_str(self) -> &'static str {
        match self {
            Persona::Pulse => "pulse",
            Persona::Sage => "sage",
            Persona::Spark => "spark",
            Persona::Haven => "haven",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sage" => Persona::Sage,
            "spark" => Persona::Spark,
            "haven" => Persona::Haven,
            _ => Persona::Pulse,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    AiResponse,
    UserReply,
    AiFollowup,
}

impl ResponseType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            ResponseType::AiResponse => "ai_response",
            ResponseType::UserReply => "user_reply",
            ResponseType::AiFollowup => "ai_followup",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "user_reply" => ResponseType::UserReply,
            "ai_followup" => ResponseType::AiFollowup,
            _ => ResponseType::AiResponse,
        }
    }
}

/// One row in a conversation thread: either a delivered persona response or a
/// user's reply to one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiResponse {
    pub id: String,
    pub journal_entry_id: String,
    pub user_id: String,
    pub persona: Persona,
    pub response_text: String,
    pub parent_id: Option<String>,
    pub conversation_thread_id: String,
    pub response_type: ResponseType,
    pub is_ai_response: bool,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
}

impl AiResponse {
    pub fn is_ai_initiated(&self) -> bool {
        matches!(
            self.response_type,
            ResponseType::AiResponse | ResponseType::AiFollowup
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserTier {
    Free,
    Premium,
    Beta,
}

impl UserTier {
    pub fn as_db_str(self) -> &'static str {
        match self {
            UserTier::Free => "free",
            UserTier::Premium => "premium",
            UserTier::Beta => "beta",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "premium" => UserTier::Premium,
            "beta" => UserTier::Beta,
            _ => UserTier::Free,
        }
    }

    /// Upper bound on AI-initiated responses per local calendar day.
    pub fn daily_cap(self) -> u32 {
        match self {
            UserTier::Free => 2,
            UserTier::Premium => 10,
            UserTier::Beta => 10,
        }
    }
}

/// Personal "how chatty should the AI be" setting. Combines with the tier cap
/// by taking the minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionLevel {
    Low,
    Balanced,
    High,
}

impl InteractionLevel {
    pub fn as_db_str(self) -> &'static str {
        match self {
            InteractionLevel::Low => "low",
            InteractionLevel::Balanced => "balanced",
            InteractionLevel::High => "high",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => InteractionLevel::Low,
            "high" => InteractionLevel::High,
            _ => InteractionLevel::Balanced,
        }
    }

    pub fn daily_cap(self) -> u32 {
        match self {
            InteractionLevel::Low => 2,
            InteractionLevel::Balanced => 5,
            InteractionLevel::High => 10,
        }
    }
}

/// Pacing state for one user. `count_date` is the local calendar day that
/// `daily_response_count` belongs to, so a stale count never satisfies
/// today's quota even before the nightly reset has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngagementState {
    pub user_id: String,
    pub last_response_at: Option<DateTime<Utc>>,
    pub daily_response_count: u32,
    pub count_date: String,
    pub tier: UserTier,
    pub ai_interaction_level: InteractionLevel,
    pub last_active_at: Option<DateTime<Utc>>,
}

impl EngagementState {
    pub fn new_for_user(user_id: &str, today: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            last_response_at: None,
            daily_response_count: 0,
            count_date: today.to_string(),
            tier: UserTier::Free,
            ai_interaction_level: InteractionLevel::Balanced,
            last_active_at: None,
        }
    }

    /// Effective daily cap: tier limit clamped by the personal setting.
    pub fn effective_daily_cap(&self) -> u32 {
        self.tier.daily_cap().min(self.ai_interaction_level.daily_cap())
    }

    /// Count that applies to the given local day; counts from a previous day
    /// read as zero.
    pub fn count_for_day(&self, today: &str) -> u32 {
        if self.count_date == today {
            self.daily_response_count
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Generating,
    Delivered,
    Failed,
    Skipped,
}

impl JobState {
    pub fn as_db_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Generating => "generating",
            JobState::Delivered => "delivered",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "generating" => JobState::Generating,
            "delivered" => JobState::Delivered,
            "failed" => JobState::Failed,
            "skipped" => JobState::Skipped,
            _ => JobState::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Delivered | JobState::Skipped)
    }
}

/// Which path created a job. Follow-up jobs are exempt from the bombardment
/// window at policy time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOrigin {
    Webhook,
    Sweep,
    Followup,
}

impl JobOrigin {
    pub fn as_db_str(self) -> &'static str {
        match self {
            JobOrigin::Webhook => "webhook",
            JobOrigin::Sweep => "sweep",
            JobOrigin::Followup => "followup",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "webhook" => JobOrigin::Webhook,
            "followup" => JobOrigin::Followup,
            _ => JobOrigin::Sweep,
        }
    }
}

/// One unit of orchestration work: deliver one persona's response to one
/// entry. The job row in the shared store is the coordination point between
/// cycles, the gateway, and restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingJob {
    pub id: String,
    pub journal_entry_id: String,
    pub user_id: String,
    pub persona: Persona,
    pub state: JobState,
    pub scheduled_at: DateTime<Utc>,
    pub attempt_count: u32,
    pub lease_at: Option<DateTime<Utc>>,
    pub origin: JobOrigin,
    pub skip_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An item of thread history handed to the text-generation collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryItem {
    PlainText {
        text: String,
    },
    PersonaTagged {
        persona: Persona,
        text: String,
        timestamp: DateTime<Utc>,
    },
}

/// "Entry created" payload delivered to the webhook gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryCreatedEvent {
    pub entry_id: String,
    pub user_id: String,
    pub content_length: usize,
    pub created_at: DateTime<Utc>,
}
