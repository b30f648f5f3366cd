use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use super::{ItemType, ParseEnumError, ProjectId, StateId, normalize};

/// Coarse lifecycle category shared by every project-specific state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Belong {
    Open,
    Working,
    Done,
    Closed,
    WontFix,
    Reopen,
    Resolved,
}

impl Belong {
    pub const ALL: [Self; 7] = [
        Self::Open,
        Self::Working,
        Self::Done,
        Self::Closed,
        Self::WontFix,
        Self::Reopen,
        Self::Resolved,
    ];

    const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Working => "WORKING",
            Self::Done => "DONE",
            Self::Closed => "CLOSED",
            Self::WontFix => "WONTFIX",
            Self::Reopen => "REOPEN",
            Self::Resolved => "RESOLVED",
        }
    }

    /// `DONE` and `CLOSED` are the only belongs that stamp a finish time and
    /// the only ones allowed inside a filed iteration.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Closed)
    }
}

impl fmt::Display for Belong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Belong {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "open" => Ok(Self::Open),
            "working" => Ok(Self::Working),
            "done" => Ok(Self::Done),
            "closed" => Ok(Self::Closed),
            "wontfix" => Ok(Self::WontFix),
            "reopen" => Ok(Self::Reopen),
            "resolved" => Ok(Self::Resolved),
            _ => Err(ParseEnumError {
                expected: "belong",
                got: s.to_string(),
            }),
        }
    }
}

/// A project-specific state for one item type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub id: StateId,
    pub project_id: ProjectId,
    pub item_type: ItemType,
    pub name: String,
    pub belong: Belong,
    /// Display position only.
    pub index: i64,
}

/// Directed edge `start -> end` of a (project, type) transition graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateRelation {
    pub project_id: ProjectId,
    pub item_type: ItemType,
    pub start_state_id: StateId,
    pub end_state_id: StateId,
}
