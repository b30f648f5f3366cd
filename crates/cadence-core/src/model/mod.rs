//! Records the lifecycle engine reads and writes.
//!
//! These mirror the persisted rows owned by the storage collaborator, reduced
//! to the fields that transition checks and cascades actually touch.

pub mod ids;
pub mod item;
pub mod iteration;
pub mod relation;
pub mod state;

pub use ids::{ItemId, IterationId, ProjectId, StateId};
pub use item::{ExpiryStatus, ItemType, WorkItem};
pub use iteration::{Iteration, IterationState};
pub use relation::{Relation, RelationType};
pub use state::{Belong, State, StateRelation};

use std::fmt;

/// Error returned when parsing an enum value from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseEnumError {
    pub expected: &'static str,
    pub got: String,
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: '{}'", self.expected, self.got)
    }
}

impl std::error::Error for ParseEnumError {}

pub(crate) fn normalize(input: &str) -> String {
    input.trim().to_ascii_lowercase()
}
