use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::EventId;

/// Append-only audit record. Drives salience scoring and (outside this
/// crate's scope) SSE fanout. `id` is assigned by the store and is
/// monotonically increasing within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<EventId>,
    pub event_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub agent_id: Option<i64>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl EngineEvent {
    /// Construct an unpersisted event; `id` is filled in once the store
    /// assigns it.
    pub fn new(event_type: impl Into<String>, metadata: Value) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            description: String::new(),
            agent_id: None,
            metadata,
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_agent(mut self, agent_id: i64) -> Self {
        self.agent_id = Some(agent_id);
        self
    }
}
