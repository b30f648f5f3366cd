//! Cascading updates: keep an item, its iteration, and its inclusion
//! hierarchy consistent after every create or update.

pub mod engine;
pub mod intent;
pub mod pool;
pub mod service;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use engine::CascadeEngine;
pub use intent::{
    CascadeOutcome, ChildCascadeJob, ChildCascadeReport, CreateRequest, UpdateIntent,
    UpdateRequest,
};
pub use pool::{CascadePool, CascadeFailure, CascadeTicket, SubmitError};
pub use service::{ChildCascadeStatus, LifecycleService, UpdateReceipt};

/// Step of the cascade pipeline, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CascadeStage {
    Validated,
    OwnFieldsRepaired,
    ParentAdvanced,
    ParentRolledUp,
    ChildrenCascaded,
}

impl CascadeStage {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Validated => "validated",
            Self::OwnFieldsRepaired => "own_fields_repaired",
            Self::ParentAdvanced => "parent_advanced",
            Self::ParentRolledUp => "parent_rolled_up",
            Self::ChildrenCascaded => "children_cascaded",
        }
    }
}

impl fmt::Display for CascadeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
