use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use super::{ItemId, ParseEnumError, normalize};

/// Kind of edge between two work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationType {
    /// Parent includes child. Only these edges take part in cascades.
    Inclusion,
    /// Plain reference between items.
    Connection,
}

impl RelationType {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Inclusion => "inclusion",
            Self::Connection => "connection",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelationType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "inclusion" => Ok(Self::Inclusion),
            "connection" => Ok(Self::Connection),
            _ => Err(ParseEnumError {
                expected: "relation type",
                got: s.to_string(),
            }),
        }
    }
}

/// Directed edge `issue_id -> related_issue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Relation {
    pub issue_id: ItemId,
    pub related_issue: ItemId,
    pub relation_type: RelationType,
}
