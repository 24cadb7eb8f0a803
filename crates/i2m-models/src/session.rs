//! Browser session record.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::ids::{JobId, SessionId};

/// Maximum number of job IDs remembered per session, newest kept.
pub const MAX_SESSION_JOBS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Session {
    pub session_id: SessionId,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    /// Most recent first
    #[serde(default)]
    pub job_ids: Vec<JobId>,
}

impl Session {
    pub fn new(session_id: SessionId) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            created_at: now,
            last_seen: now,
            job_ids: Vec::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Utc::now();
    }
}
