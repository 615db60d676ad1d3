use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::database::SchedulerDatabase;
use crate::models::{AiResponse, HistoryItem, Persona, ResponseType};

/// Append-only access to conversation threads. A thread is the chain of
/// responses and replies rooted at one journal entry, grouped by
/// `conversation_thread_id`. Delivered rows are never updated or deleted.
pub struct ThreadStore {
    db: Arc<SchedulerDatabase>,
}

/// A response about to be appended. The store assigns the id, the thread id
/// and the timestamp so thread ordering stays monotonic.
#[derive(Debug, Clone)]
pub struct NewResponse {
    pub journal_entry_id: String,
    pub user_id: String,
    pub persona: Persona,
    pub response_text: String,
    pub parent_id: Option<String>,
    pub response_type: ResponseType,
    pub confidence: f64,
}

impl ThreadStore {
    pub fn new(db: Arc<SchedulerDatabase>) -> Self {
        Self { db }
    }

    /// Validate parentage and build the full row for a new response. Roots
    /// (parent_id None) open a new thread only when the entry has none yet;
    /// non-roots must point at an existing row and inherit its thread id.
    pub fn prepare(&self, new: &NewResponse, now: DateTime<Utc>) -> Result<AiResponse> {
        let thread_id = match &new.parent_id {
            None => {
                if new.response_type != ResponseType::AiResponse {
                    bail!(
                        "Thread root for entry {} must be an ai_response, got {:?}",
                        new.journal_entry_id,
                        new.response_type
                    );
                }
                match self.db.thread_id_for_entry(&new.journal_entry_id)? {
                    // Another persona already rooted this entry's thread;
                    // join it rather than forking a second thread.
                    Some(existing) => existing,
                    None => uuid::Uuid::new_v4().to_string(),
                }
            }
            Some(parent_id) => {
                let parent = self
                    .db
                    .get_response(parent_id)?
                    .with_context(|| format!("Parent response {} not found", parent_id))?;
                if parent.journal_entry_id != new.journal_entry_id {
                    bail!(
                        "Parent {} belongs to entry {}, not {}",
                        parent_id,
                        parent.journal_entry_id,
                        new.journal_entry_id
                    );
                }
                parent.conversation_thread_id
            }
        };

        // Timestamps within a thread never go backwards, even against a
        // clock that does.
        let last_ts = self
            .db
            .thread_rows_for_entry(&new.journal_entry_id)?
            .last()
            .map(|row| row.created_at);
        let created_at = match last_ts {
            Some(last) if last > now => last,
            _ => now,
        };

        Ok(AiResponse {
            id: uuid::Uuid::new_v4().to_string(),
            journal_entry_id: new.journal_entry_id.clone(),
            user_id: new.user_id.clone(),
            persona: new.persona,
            response_text: new.response_text.clone(),
            parent_id: new.parent_id.clone(),
            conversation_thread_id: thread_id,
            response_type: new.response_type,
            is_ai_response: new.response_type != ResponseType::UserReply,
            confidence: new.confidence,
            created_at,
        })
    }

    /// Validate and insert in one step. Used for user replies (the external
    /// reply-submission path); orchestrated deliveries go through `prepare`
    /// and the database's transactional delivery instead.
    pub fn append(&self, new: &NewResponse, now: DateTime<Utc>) -> Result<AiResponse> {
        let row = self.prepare(new, now)?;
        if !self.db.insert_response(&row)? {
            bail!(
                "Response for entry {} persona {} already exists",
                row.journal_entry_id,
                row.persona.as_db_str()
            );
        }
        Ok(row)
    }

    /// All rows for the entry's thread, created_at ascending.
    pub fn read_thread(&self, entry_id: &str) -> Result<Vec<AiResponse>> {
        self.db.thread_rows_for_entry(entry_id)
    }

    /// Thread history shaped for the text-generation collaborator: the entry
    /// itself as plain text, every response persona-tagged.
    pub fn history_for_generation(
        &self,
        entry_id: &str,
        entry_content: &str,
        limit: usize,
    ) -> Result<Vec<HistoryItem>> {
        let rows = self.read_thread(entry_id)?;
        let mut history = vec![HistoryItem::PlainText {
            text: entry_content.to_string(),
        }];
        let skip = rows.len().saturating_sub(limit);
        for row in rows.into_iter().skip(skip) {
            history.push(if row.is_ai_initiated() {
                HistoryItem::PersonaTagged {
                    persona: row.persona,
                    text: row.response_text,
                    timestamp: row.created_at,
                }
            } else {
                HistoryItem::PlainText {
                    text: row.response_text,
                }
            });
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::test_support::{sample_entry, temp_db_path};

    fn store() -> (ThreadStore, Arc<SchedulerDatabase>) {
        let db = Arc::new(SchedulerDatabase::new(temp_db_path("thread_store")).expect("db init"));
        (ThreadStore::new(db.clone()), db)
    }

    fn root_response(entry_id: &str, user_id: &str, persona: Persona) -> NewResponse {
        NewResponse {
            journal_entry_id: entry_id.to_string(),
            user_id: user_id.to_string(),
            persona,
            response_text: "That sounds like a real step forward.".to_string(),
            parent_id: None,
            response_type: ResponseType::AiResponse,
            confidence: 0.8,
        }
    }

    #[test]
    fn second_persona_joins_the_existing_thread() {
        let (store, _db) = store();
        let entry = sample_entry("u1", "Today was long but satisfying overall.");

        let first = store
            .append(&root_response(&entry.id, &entry.user_id, Persona::Pulse), Utc::now())
            .expect("first root");
        let second = store
            .append(&root_response(&entry.id, &entry.user_id, Persona::Sage), Utc::now())
            .expect("second root");
        assert_eq!(first.conversation_thread_id, second.conversation_thread_id);
    }

    #[test]
    fn reply_inherits_thread_and_bad_parent_is_rejected() {
        let (store, _db) = store();
        let entry = sample_entry("u1", "Today was long but satisfying overall.");
        let root = store
            .append(&root_response(&entry.id, &entry.user_id, Persona::Pulse), Utc::now())
            .expect("root");

        let reply = store
            .append(
                &NewResponse {
                    journal_entry_id: entry.id.clone(),
                    user_id: entry.user_id.clone(),
                    persona: Persona::Pulse,
                    response_text: "Thanks, it really was.".to_string(),
                    parent_id: Some(root.id.clone()),
                    response_type: ResponseType::UserReply,
                    confidence: 1.0,
                },
                Utc::now(),
            )
            .expect("reply");
        assert_eq!(reply.conversation_thread_id, root.conversation_thread_id);
        assert!(!reply.is_ai_response);

        let missing_parent = store.append(
            &NewResponse {
                journal_entry_id: entry.id.clone(),
                user_id: entry.user_id.clone(),
                persona: Persona::Sage,
                response_text: "orphan".to_string(),
                parent_id: Some("no-such-row".to_string()),
                response_type: ResponseType::AiFollowup,
                confidence: 0.5,
            },
            Utc::now(),
        );
        assert!(missing_parent.is_err());

        let other_entry = sample_entry("u1", "A different entry entirely, also long.");
        let cross_thread = store.append(
            &NewResponse {
                journal_entry_id: other_entry.id.clone(),
                user_id: other_entry.user_id.clone(),
                persona: Persona::Sage,
                response_text: "crossed".to_string(),
                parent_id: Some(root.id.clone()),
                response_type: ResponseType::AiFollowup,
                confidence: 0.5,
            },
            Utc::now(),
        );
        assert!(cross_thread.is_err());
    }

    #[test]
    fn append_timestamps_never_go_backwards() {
        let (store, _db) = store();
        let entry = sample_entry("u1", "Today was long but satisfying overall.");
        let now = Utc::now();
        let root = store
            .append(&root_response(&entry.id, &entry.user_id, Persona::Pulse), now)
            .expect("root");

        // A caller with a lagging clock still appends at or after the tail.
        let lagging = now - chrono::Duration::minutes(5);
        let next = store
            .append(&root_response(&entry.id, &entry.user_id, Persona::Sage), lagging)
            .expect("lagging append");
        assert!(next.created_at >= root.created_at);
    }

    #[test]
    fn history_tags_personas_and_keeps_the_entry_first() {
        let (store, _db) = store();
        let entry = sample_entry("u1", "Today was long but satisfying overall.");
        let root = store
            .append(&root_response(&entry.id, &entry.user_id, Persona::Pulse), Utc::now())
            .expect("root");
        store
            .append(
                &NewResponse {
                    journal_entry_id: entry.id.clone(),
                    user_id: entry.user_id.clone(),
                    persona: Persona::Pulse,
                    response_text: "Thanks!".to_string(),
                    parent_id: Some(root.id),
                    response_type: ResponseType::UserReply,
                    confidence: 1.0,
                },
                Utc::now(),
            )
            .expect("reply");

        let history = store
            .history_for_generation(&entry.id, &entry.content, 10)
            .expect("history");
        assert_eq!(history.len(), 3);
        assert!(matches!(&history[0], HistoryItem::PlainText { text } if text == &entry.content));
        assert!(matches!(
            &history[1],
            HistoryItem::PersonaTagged { persona: Persona::Pulse, .. }
        ));
        assert!(matches!(&history[2], HistoryItem::PlainText { .. }));
    }
}
