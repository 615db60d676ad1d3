use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::models::{EngagementState, JournalEntry};

/// What caused this evaluation. Follow-ups requested by an explicit user
/// reply bypass the bombardment window; only proactive sweeps are subject to
/// the activity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyTrigger {
    /// First response to a brand-new entry (webhook or sweep).
    NewEntry,
    /// Proactive follow-up proposed by the sweep.
    SweepFollowup,
    /// Follow-up requested by an explicit user reply.
    UserReplyFollowup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IneligibleReason {
    EntryIsAiResponse,
    ContentTooShort,
    BombardmentWindow,
    QuotaExhausted,
    UserInactive,
}

impl IneligibleReason {
    pub fn as_str(self) -> &'static str {
        match self {
            IneligibleReason::EntryIsAiResponse => "entry_is_ai_response",
            IneligibleReason::ContentTooShort => "content_too_short",
            IneligibleReason::BombardmentWindow => "bombardment_window",
            IneligibleReason::QuotaExhausted => "quota_exhausted",
            IneligibleReason::UserInactive => "user_inactive",
        }
    }

    /// Fatal reasons can never become eligible later; retrying them is
    /// pointless.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            IneligibleReason::EntryIsAiResponse | IneligibleReason::ContentTooShort
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngagementDecision {
    Eligible,
    Ineligible(IneligibleReason),
}

impl EngagementDecision {
    pub fn is_eligible(self) -> bool {
        matches!(self, EngagementDecision::Eligible)
    }
}

/// The rule set deciding whether a user/entry pair currently qualifies for an
/// AI response. Stateless per call; every verdict is a value, not an error,
/// so outcomes stay auditable.
pub struct EngagementPolicy {
    min_entry_chars: usize,
    bombardment_window_secs: i64,
    active_window_days: i64,
}

impl EngagementPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            min_entry_chars: config.min_entry_chars,
            bombardment_window_secs: config.bombardment_window_secs(),
            active_window_days: config.active_window_days as i64,
        }
    }

    /// Ordered checks, short-circuiting on the first failure.
    pub fn evaluate(
        &self,
        entry: &JournalEntry,
        state: &EngagementState,
        trigger: PolicyTrigger,
        now: DateTime<Utc>,
        today: &str,
    ) -> EngagementDecision {
        if entry.is_ai_response {
            return EngagementDecision::Ineligible(IneligibleReason::EntryIsAiResponse);
        }

        if entry.content.chars().count() < self.min_entry_chars {
            return EngagementDecision::Ineligible(IneligibleReason::ContentTooShort);
        }

        if trigger != PolicyTrigger::UserReplyFollowup {
            if let Some(last) = state.last_response_at {
                let elapsed = (now - last).num_seconds();
                if elapsed < self.bombardment_window_secs {
                    return EngagementDecision::Ineligible(IneligibleReason::BombardmentWindow);
                }
            }
        }

        if state.count_for_day(today) >= state.effective_daily_cap() {
            return EngagementDecision::Ineligible(IneligibleReason::QuotaExhausted);
        }

        if trigger == PolicyTrigger::SweepFollowup {
            let active = state
                .last_active_at
                .map(|at| (now - at).num_days() < self.active_window_days)
                .unwrap_or(false);
            if !active {
                return EngagementDecision::Ineligible(IneligibleReason::UserInactive);
            }
        }

        EngagementDecision::Eligible
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{InteractionLevel, UserTier};
    use chrono::Duration as ChronoDuration;

    const TODAY: &str = "2026-08-25";

    fn policy() -> EngagementPolicy {
        EngagementPolicy::from_config(&SchedulerConfig::default())
    }

    fn entry(content: &str) -> JournalEntry {
        JournalEntry {
            id: "e1".to_string(),
            user_id: "u1".to_string(),
            content: content.to_string(),
            mood: None,
            energy: None,
            stress: None,
            created_at: Utc::now(),
            is_ai_response: false,
            deleted_at: None,
        }
    }

    fn fresh_state() -> EngagementState {
        let mut state = EngagementState::new_for_user("u1", TODAY);
        state.last_active_at = Some(Utc::now());
        state
    }

    #[test]
    fn ai_entries_are_rejected_before_anything_else() {
        let mut e = entry("Plenty of content in this one, well over the minimum.");
        e.is_ai_response = true;
        let decision = policy().evaluate(&e, &fresh_state(), PolicyTrigger::NewEntry, Utc::now(), TODAY);
        assert_eq!(
            decision,
            EngagementDecision::Ineligible(IneligibleReason::EntryIsAiResponse)
        );
        assert!(IneligibleReason::EntryIsAiResponse.is_fatal());
    }

    #[test]
    fn short_content_is_rejected() {
        let decision = policy().evaluate(
            &entry("Tired now."),
            &fresh_state(),
            PolicyTrigger::NewEntry,
            Utc::now(),
            TODAY,
        );
        assert_eq!(
            decision,
            EngagementDecision::Ineligible(IneligibleReason::ContentTooShort)
        );
    }

    #[test]
    fn bombardment_window_blocks_except_user_reply_followups() {
        let now = Utc::now();
        let mut state = fresh_state();
        state.last_response_at = Some(now - ChronoDuration::minutes(30));
        let e = entry("A long enough entry to pass the content check easily.");

        let blocked = policy().evaluate(&e, &state, PolicyTrigger::NewEntry, now, TODAY);
        assert_eq!(
            blocked,
            EngagementDecision::Ineligible(IneligibleReason::BombardmentWindow)
        );

        let allowed = policy().evaluate(&e, &state, PolicyTrigger::UserReplyFollowup, now, TODAY);
        assert!(allowed.is_eligible());
    }

    #[test]
    fn quota_exhausted_for_free_tier_at_two() {
        let mut state = fresh_state();
        state.tier = UserTier::Free;
        state.ai_interaction_level = InteractionLevel::High;
        state.daily_response_count = 2;
        let e = entry("A long enough entry to pass the content check easily.");

        let decision = policy().evaluate(&e, &state, PolicyTrigger::NewEntry, Utc::now(), TODAY);
        assert_eq!(
            decision,
            EngagementDecision::Ineligible(IneligibleReason::QuotaExhausted)
        );
    }

    #[test]
    fn stale_count_from_yesterday_does_not_consume_quota() {
        let mut state = fresh_state();
        state.count_date = "2026-08-24".to_string();
        state.daily_response_count = 2;
        let e = entry("A long enough entry to pass the content check easily.");

        let decision = policy().evaluate(&e, &state, PolicyTrigger::NewEntry, Utc::now(), TODAY);
        assert!(decision.is_eligible());
    }

    #[test]
    fn inactivity_only_blocks_proactive_followups() {
        let now = Utc::now();
        let mut state = fresh_state();
        state.last_active_at = Some(now - ChronoDuration::days(10));
        let e = entry("A long enough entry to pass the content check easily.");

        // First response to a fresh entry is exempt from the activity check.
        assert_eq!(
            policy().evaluate(&e, &state, PolicyTrigger::NewEntry, now, TODAY),
            EngagementDecision::Eligible
        );
        assert_eq!(
            policy().evaluate(&e, &state, PolicyTrigger::SweepFollowup, now, TODAY),
            EngagementDecision::Ineligible(IneligibleReason::UserInactive)
        );
    }
}
