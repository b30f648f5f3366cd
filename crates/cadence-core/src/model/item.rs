use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

use super::{ItemId, IterationId, ParseEnumError, ProjectId, StateId, normalize};

/// Kinds of work item a project tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemType {
    Requirement,
    Task,
    Bug,
    Epic,
    Ticket,
}

impl ItemType {
    pub const ALL: [Self; 5] = [
        Self::Requirement,
        Self::Task,
        Self::Bug,
        Self::Epic,
        Self::Ticket,
    ];

    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Requirement => "requirement",
            Self::Task => "task",
            Self::Bug => "bug",
            Self::Epic => "epic",
            Self::Ticket => "ticket",
        }
    }
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize(s).as_str() {
            "requirement" => Ok(Self::Requirement),
            "task" => Ok(Self::Task),
            "bug" => Ok(Self::Bug),
            "epic" => Ok(Self::Epic),
            "ticket" => Ok(Self::Ticket),
            _ => Err(ParseEnumError {
                expected: "item type",
                got: s.to_string(),
            }),
        }
    }
}

/// How close an item's plan finish is, relative to today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExpiryStatus {
    /// No plan finish date.
    #[default]
    #[serde(rename = "unspecified")]
    Unspecified,
    #[serde(rename = "expired")]
    Expired,
    /// Finishes today.
    #[serde(rename = "expire_in_1_day")]
    ExpireIn1Day,
    /// Finishes tomorrow.
    #[serde(rename = "expire_in_2_days")]
    ExpireIn2Days,
    #[serde(rename = "expire_in_7_days")]
    ExpireIn7Days,
    #[serde(rename = "expire_in_30_days")]
    ExpireIn30Days,
    #[serde(rename = "expire_in_future")]
    ExpireInFuture,
}

impl ExpiryStatus {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Unspecified => "unspecified",
            Self::Expired => "expired",
            Self::ExpireIn1Day => "expire_in_1_day",
            Self::ExpireIn2Days => "expire_in_2_days",
            Self::ExpireIn7Days => "expire_in_7_days",
            Self::ExpireIn30Days => "expire_in_30_days",
            Self::ExpireInFuture => "expire_in_future",
        }
    }
}

impl fmt::Display for ExpiryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExpiryStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = normalize(s);
        [
            Self::Unspecified,
            Self::Expired,
            Self::ExpireIn1Day,
            Self::ExpireIn2Days,
            Self::ExpireIn7Days,
            Self::ExpireIn30Days,
            Self::ExpireInFuture,
        ]
        .into_iter()
        .find(|status| status.as_str() == normalized)
        .ok_or_else(|| ParseEnumError {
            expected: "expiry status",
            got: s.to_string(),
        })
    }
}

/// The persisted work item (issue) as the engine sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: ItemId,
    pub project_id: ProjectId,
    pub item_type: ItemType,
    pub title: String,
    pub iteration_id: IterationId,
    pub state: StateId,
    pub plan_started_at: Option<DateTime<Utc>>,
    pub plan_finished_at: Option<DateTime<Utc>>,
    /// Set the first time the item leaves an OPEN state.
    pub start_time: Option<DateTime<Utc>>,
    /// Present exactly while the item sits in a DONE or CLOSED state.
    pub finish_time: Option<DateTime<Utc>>,
    pub reopen_count: u32,
    pub expiry_status: ExpiryStatus,
}

#[cfg(test)]
mod tests {
    use super::{ExpiryStatus, ItemType};
    use std::str::FromStr;

    #[test]
    fn item_type_parse_is_case_insensitive() {
        assert_eq!(ItemType::from_str(" Requirement ").unwrap(), ItemType::Requirement);
        assert_eq!(ItemType::from_str("EPIC").unwrap(), ItemType::Epic);
        assert!(ItemType::from_str("story").is_err());
        for ty in ItemType::ALL {
            assert_eq!(ItemType::from_str(&ty.to_string()).unwrap(), ty);
        }
    }

    #[test]
    fn expiry_status_text_matches_serde() {
        let json = serde_json::to_string(&ExpiryStatus::ExpireIn7Days).unwrap();
        assert_eq!(json, "\"expire_in_7_days\"");
        assert_eq!(
            ExpiryStatus::from_str("expire_in_7_days").unwrap(),
            ExpiryStatus::ExpireIn7Days
        );
        assert!(ExpiryStatus::from_str("soon").is_err());
    }
}
