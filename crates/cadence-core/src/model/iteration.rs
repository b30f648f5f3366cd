use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::{IterationId, ProjectId};

/// Whether an iteration still accepts unfinished work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IterationState {
    #[default]
    Unfiled,
    /// Archived. Only DONE/CLOSED items may sit in a filed iteration.
    Filed,
}

impl fmt::Display for IterationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unfiled => "UNFILED",
            Self::Filed => "FILED",
        })
    }
}

/// A time-boxed container (sprint). The window is inclusive at day
/// granularity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iteration {
    pub id: IterationId,
    pub project_id: ProjectId,
    pub title: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: IterationState,
}

impl Iteration {
    #[must_use]
    pub fn is_filed(&self) -> bool {
        self.state == IterationState::Filed
    }
}
