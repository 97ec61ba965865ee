use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// The coarse-grained conversation snapshot saved and reloaded when a run resumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub id: String,
    pub session_id: Option<String>,
    pub title: Option<String>,
    pub messages: Vec<ConversationMessage>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationState {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            session_id: None,
            title: None,
            messages: Vec::new(),
            metadata: serde_json::Value::Null,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn push_message(&mut self, role: impl Into<String>, content: impl Into<String>) {
        let now = Utc::now();
        self.messages.push(ConversationMessage {
            role: role.into(),
            content: content.into(),
            timestamp: now,
        });
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationFilter {
    pub session_id: Option<String>,
    pub updated_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}
