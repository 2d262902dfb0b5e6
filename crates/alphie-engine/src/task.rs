use serde::{Deserialize, Serialize};

use alphie_core::TaskId;

/// A unit of work handed to one agent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    pub description: String,
    /// Free-form description of how success can be checked.
    pub verification_intent: String,
    /// Paths or glob patterns the agent is allowed to touch.
    pub file_boundaries: Vec<String>,
}

impl Task {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            title: title.into(),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: TaskId) -> Self {
        self.id = id;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_verification(mut self, intent: impl Into<String>) -> Self {
        self.verification_intent = intent.into();
        self
    }

    pub fn with_boundaries(mut self, boundaries: Vec<String>) -> Self {
        self.file_boundaries = boundaries;
        self
    }
}
