use std::fmt;

use crate::cascade::CascadeStage;
use crate::model::{Belong, ItemId, StateId};
use crate::schedule::ScheduleError;

/// Machine-readable error codes so API layers can map failures without
/// string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    MalformedRequest,
    ItemNotFound,
    RecordNotFound,
    IllegalTransition,
    TransitionDenied,
    OutOfIterationWindow,
    ArchivedIteration,
    StartAfterFinish,
    InvalidLookupId,
    LookupFailed,
    CascadeStepFailed,
    InclusionCycle,
    CascadeTooDeep,
    StorageFailure,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::MalformedRequest => "E1002",
            Self::ItemNotFound => "E2001",
            Self::RecordNotFound => "E2002",
            Self::IllegalTransition => "E3001",
            Self::TransitionDenied => "E3002",
            Self::OutOfIterationWindow => "E4001",
            Self::ArchivedIteration => "E4002",
            Self::StartAfterFinish => "E4003",
            Self::InvalidLookupId => "E5001",
            Self::LookupFailed => "E5002",
            Self::CascadeStepFailed => "E6001",
            Self::InclusionCycle => "E6002",
            Self::CascadeTooDeep => "E6003",
            Self::StorageFailure => "E7001",
        }
    }

    /// Short human-facing summary for logs and API bodies.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::MalformedRequest => "Malformed request",
            Self::ItemNotFound => "Item not found",
            Self::RecordNotFound => "Referenced record not found",
            Self::IllegalTransition => "State transition is not configured",
            Self::TransitionDenied => "State transition not permitted",
            Self::OutOfIterationWindow => "Date outside iteration window",
            Self::ArchivedIteration => "Iteration is archived",
            Self::StartAfterFinish => "Plan start after plan finish",
            Self::InvalidLookupId => "Invalid lookup id",
            Self::LookupFailed => "Lookup failed",
            Self::CascadeStepFailed => "Cascade step failed",
            Self::InclusionCycle => "Inclusion hierarchy contains a cycle",
            Self::CascadeTooDeep => "Cascade exceeded depth limit",
            Self::StorageFailure => "Storage failure",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in .cadence/config.toml and retry."),
            Self::IllegalTransition => {
                Some("Pick a target state reachable from the current state in the workflow.")
            }
            Self::TransitionDenied => Some("Ask a project manager for the required permission."),
            Self::OutOfIterationWindow => {
                Some("Choose plan dates between the iteration's start and finish.")
            }
            Self::ArchivedIteration => {
                Some("Finish or close the item first, or choose an active iteration.")
            }
            Self::StartAfterFinish => Some("Plan start must not be later than plan finish."),
            Self::InclusionCycle => Some("Remove the inclusion link that closes the loop."),
            Self::CascadeTooDeep => Some("Raise cascade.max_depth or flatten the hierarchy."),
            Self::LookupFailed | Self::StorageFailure => {
                Some("Retry once. If persistent, check the store.")
            }
            Self::MalformedRequest
            | Self::ItemNotFound
            | Self::RecordNotFound
            | Self::InvalidLookupId
            | Self::CascadeStepFailed => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// The response class an API layer should map an error to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// The request itself does not make sense.
    Malformed,
    /// The caller is not allowed to perform the transition.
    Forbidden,
    /// The workflow has no edge for the transition.
    IllegalTransition,
    /// Plan dates or iteration placement break an invariant.
    InvalidSchedule,
    /// A referenced record could not be loaded.
    Lookup,
    Internal,
}

/// Storage collaborator failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    #[must_use]
    pub const fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Read-through cache failures.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("{kind} id must be positive, got {id}")]
    InvalidId { kind: &'static str, id: i64 },

    #[error("lookup of {kind} {id} failed: {source}")]
    LookupFailed {
        kind: &'static str,
        id: i64,
        #[source]
        source: StoreError,
    },
}

/// Everything the engine can report to a caller.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("{item_id}: no transition configured from {from} to {to}")]
    IllegalTransition {
        item_id: ItemId,
        from: StateId,
        to: StateId,
    },

    #[error("{item_id}: transition from {from} to {to} is not permitted")]
    Forbidden {
        item_id: ItemId,
        from: StateId,
        to: StateId,
    },

    #[error("{item_id}: {source}")]
    Schedule {
        item_id: ItemId,
        #[source]
        source: ScheduleError,
    },

    #[error(transparent)]
    Lookup(#[from] CacheError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("cascade stopped at {item_id} during {stage}: {source}")]
    Cascade {
        item_id: ItemId,
        stage: CascadeStage,
        #[source]
        source: Box<EngineError>,
    },

    #[error("inclusion cycle detected: {item_id} was already visited in this cascade")]
    CycleDetected { item_id: ItemId },

    #[error("cascade below {item_id} exceeded the depth limit of {limit}")]
    DepthExceeded { item_id: ItemId, limit: usize },

    #[error("{item_id}: state {state} ({belong}) does not belong to this item's workflow")]
    ForeignState {
        item_id: ItemId,
        state: StateId,
        belong: Belong,
    },
}

impl EngineError {
    pub(crate) fn schedule(item_id: ItemId, source: ScheduleError) -> Self {
        Self::Schedule { item_id, source }
    }

    pub(crate) fn at_stage(self, item_id: ItemId, stage: CascadeStage) -> Self {
        match self {
            already @ Self::Cascade { .. } => already,
            other => Self::Cascade {
                item_id,
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Machine-readable code associated with this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Malformed(_) | Self::ForeignState { .. } => ErrorCode::MalformedRequest,
            Self::IllegalTransition { .. } => ErrorCode::IllegalTransition,
            Self::Forbidden { .. } => ErrorCode::TransitionDenied,
            Self::Schedule { source, .. } => source.code(),
            Self::Lookup(CacheError::InvalidId { .. }) => ErrorCode::InvalidLookupId,
            Self::Lookup(CacheError::LookupFailed { source, .. }) => {
                if source.is_not_found() {
                    ErrorCode::RecordNotFound
                } else {
                    ErrorCode::LookupFailed
                }
            }
            Self::Store(StoreError::NotFound { entity, .. }) => {
                if *entity == "item" {
                    ErrorCode::ItemNotFound
                } else {
                    ErrorCode::RecordNotFound
                }
            }
            Self::Store(_) => ErrorCode::StorageFailure,
            Self::Cascade { .. } => ErrorCode::CascadeStepFailed,
            Self::CycleDetected { .. } => ErrorCode::InclusionCycle,
            Self::DepthExceeded { .. } => ErrorCode::CascadeTooDeep,
        }
    }

    /// Response class. Cascade failures report the class of their root cause.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Malformed(_) | Self::ForeignState { .. } => ErrorCategory::Malformed,
            Self::IllegalTransition { .. } => ErrorCategory::IllegalTransition,
            Self::Forbidden { .. } => ErrorCategory::Forbidden,
            Self::Schedule { .. } => ErrorCategory::InvalidSchedule,
            Self::Lookup(_) | Self::Store(StoreError::NotFound { .. }) => ErrorCategory::Lookup,
            Self::Cascade { source, .. } => source.category(),
            Self::Store(_) | Self::CycleDetected { .. } | Self::DepthExceeded { .. } => {
                ErrorCategory::Internal
            }
        }
    }

    /// Optional remediation hint for operators.
    #[must_use]
    pub fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}
