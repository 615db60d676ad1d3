use chrono::Duration as ChronoDuration;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::models::{JournalEntry, Persona, UserTier};

/// Advisory topic tags detected from an entry. Input to affinity weighting;
/// never a hard filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Work,
    Relationships,
    Health,
    Sleep,
    Stress,
    Gratitude,
    Creativity,
}

const TOPIC_KEYWORDS: &[(Topic, &[&str])] = &[
    (
        Topic::Work,
        &["work", "job", "meeting", "deadline", "boss", "project", "office"],
    ),
    (
        Topic::Relationships,
        &["friend", "partner", "family", "mom", "dad", "relationship", "argument"],
    ),
    (
        Topic::Health,
        &["doctor", "sick", "workout", "exercise", "gym", "pain", "health"],
    ),
    (
        Topic::Sleep,
        &["sleep", "slept", "tired", "insomnia", "exhausted", "nap", "awake"],
    ),
    (
        Topic::Stress,
        &["stress", "anxious", "anxiety", "overwhelmed", "panic", "worried"],
    ),
    (
        Topic::Gratitude,
        &["grateful", "thankful", "appreciate", "lucky", "blessed"],
    ),
    (
        Topic::Creativity,
        &["writing", "painting", "music", "drawing", "idea", "creative"],
    ),
];

/// Keyword pass over the content plus the entry's self-reported scalars.
pub fn detect_topics(entry: &JournalEntry) -> Vec<Topic> {
    let lowered = entry.content.to_lowercase();
    let mut topics: Vec<Topic> = TOPIC_KEYWORDS
        .iter()
        .filter(|(_, keywords)| keywords.iter().any(|kw| lowered.contains(kw)))
        .map(|(topic, _)| *topic)
        .collect();

    if entry.stress.unwrap_or(0.0) >= 0.7 && !topics.contains(&Topic::Stress) {
        topics.push(Topic::Stress);
    }
    if entry.energy.unwrap_or(1.0) <= 0.2 && !topics.contains(&Topic::Sleep) {
        topics.push(Topic::Sleep);
    }
    topics
}

/// Tone profile for one persona: which topics it leans into and how it reads
/// mood. Weighting only; any persona may comment on any topic.
struct PersonaProfile {
    persona: Persona,
    affinities: &'static [Topic],
    /// Preference for low-mood entries; positive profiles prefer upbeat ones.
    prefers_low_mood: bool,
}

const PROFILES: [PersonaProfile; 4] = [
    PersonaProfile {
        persona: Persona::Pulse,
        affinities: &[Topic::Health, Topic::Sleep, Topic::Stress],
        prefers_low_mood: true,
    },
    PersonaProfile {
        persona: Persona::Sage,
        affinities: &[Topic::Work, Topic::Relationships],
        prefers_low_mood: false,
    },
    PersonaProfile {
        persona: Persona::Spark,
        affinities: &[Topic::Creativity, Topic::Gratitude],
        prefers_low_mood: false,
    },
    PersonaProfile {
        persona: Persona::Haven,
        affinities: &[Topic::Stress, Topic::Relationships, Topic::Sleep],
        prefers_low_mood: true,
    },
];

/// A selected persona and how long after the previous delivery it should
/// land.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonaPick {
    pub persona: Persona,
    pub target_delay: ChronoDuration,
}

pub struct PersonaSelector {
    default_persona: Persona,
    max_personas_per_entry: usize,
    stagger_min_mins: u32,
    stagger_max_mins: u32,
}

impl PersonaSelector {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            default_persona: config.default_persona,
            max_personas_per_entry: config.max_personas_per_entry.max(1),
            stagger_min_mins: config.stagger_min_mins,
            stagger_max_mins: config.stagger_max_mins.max(config.stagger_min_mins + 1),
        }
    }

    /// Choose which personas respond to this entry and in what order.
    /// Personas already holding a root response are excluded outright; the
    /// rest are ordered by affinity score. Free tier gets at most the default
    /// persona; later picks are staggered so replies never land together.
    pub fn select(
        &self,
        entry: &JournalEntry,
        topics: &[Topic],
        already_responded: &[Persona],
        tier: UserTier,
    ) -> Vec<PersonaPick> {
        if tier == UserTier::Free {
            if already_responded.contains(&self.default_persona) {
                return Vec::new();
            }
            return vec![PersonaPick {
                persona: self.default_persona,
                target_delay: ChronoDuration::zero(),
            }];
        }

        let mut scored: Vec<(f64, Persona)> = PROFILES
            .iter()
            .filter(|profile| !already_responded.contains(&profile.persona))
            .map(|profile| (score_profile(profile, entry, topics, self.default_persona), profile.persona))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut rng = rand::thread_rng();
        scored
            .into_iter()
            .take(self.max_personas_per_entry)
            .enumerate()
            .map(|(i, (_, persona))| {
                let delay = if i == 0 {
                    ChronoDuration::zero()
                } else {
                    ChronoDuration::minutes(
                        rng.gen_range(self.stagger_min_mins..=self.stagger_max_mins) as i64,
                    )
                };
                PersonaPick {
                    persona,
                    target_delay: delay,
                }
            })
            .collect()
    }
}

fn score_profile(
    profile: &PersonaProfile,
    entry: &JournalEntry,
    topics: &[Topic],
    default_persona: Persona,
) -> f64 {
    let mut score = 1.0;
    for topic in topics {
        if profile.affinities.contains(topic) {
            score += 1.0;
        }
    }
    if let Some(mood) = entry.mood {
        let low_mood = mood < 0.4;
        if low_mood == profile.prefers_low_mood {
            score += 0.5;
        }
    }
    // Stable tiebreak toward the configured default.
    if profile.persona == default_persona {
        score += 0.1;
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(content: &str, mood: Option<f32>) -> JournalEntry {
        JournalEntry {
            id: "e1".to_string(),
            user_id: "u1".to_string(),
            content: content.to_string(),
            mood,
            energy: None,
            stress: None,
            created_at: Utc::now(),
            is_ai_response: false,
            deleted_at: None,
        }
    }

    fn selector() -> PersonaSelector {
        PersonaSelector::from_config(&SchedulerConfig::default())
    }

    #[test]
    fn detects_topics_from_keywords_and_scalars() {
        let e = entry("Huge deadline at work tomorrow, barely slept.", None);
        let topics = detect_topics(&e);
        assert!(topics.contains(&Topic::Work));
        assert!(topics.contains(&Topic::Sleep));

        let mut stressed = entry("Nothing much happened today honestly.", None);
        stressed.stress = Some(0.9);
        assert!(detect_topics(&stressed).contains(&Topic::Stress));
    }

    #[test]
    fn free_tier_gets_only_the_default_persona() {
        let e = entry("Feeling thankful for my friends this evening.", Some(0.8));
        let picks = selector().select(&e, &[Topic::Gratitude], &[], UserTier::Free);
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].persona, Persona::Pulse);

        let picks = selector().select(&e, &[], &[Persona::Pulse], UserTier::Free);
        assert!(picks.is_empty());
    }

    #[test]
    fn responded_personas_are_excluded_and_replacement_is_staggered() {
        let e = entry("Long day at work, meetings back to back.", Some(0.3));
        let topics = detect_topics(&e);
        let picks = selector().select(&e, &topics, &[Persona::Pulse], UserTier::Premium);

        assert!(!picks.is_empty());
        assert!(picks.iter().all(|p| p.persona != Persona::Pulse));
        // Work affinity should pull sage to the front.
        assert_eq!(picks[0].persona, Persona::Sage);
        for pick in picks.iter().skip(1) {
            assert!(pick.target_delay >= ChronoDuration::minutes(2));
            assert!(pick.target_delay <= ChronoDuration::minutes(10));
        }
    }

    #[test]
    fn premium_respects_max_personas() {
        let e = entry("An ordinary day, nothing special to report here.", None);
        let picks = selector().select(&e, &[], &[], UserTier::Premium);
        assert_eq!(picks.len(), 2);
        assert_eq!(picks[0].target_delay, ChronoDuration::zero());
    }

    #[test]
    fn affinity_weights_never_exclude_off_topic_personas() {
        let e = entry("Painted all afternoon, new ideas everywhere.", Some(0.9));
        let mut config = SchedulerConfig::default();
        config.max_personas_per_entry = 4;
        let picks = PersonaSelector::from_config(&config).select(
            &e,
            &[Topic::Creativity],
            &[],
            UserTier::Beta,
        );
        // Every persona is still eligible; affinity only ordered them.
        assert_eq!(picks.len(), 4);
        assert_eq!(picks[0].persona, Persona::Spark);
    }
}
