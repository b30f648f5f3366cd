use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }
    };
}

numeric_id!(
    /// Identity of a work item.
    ItemId,
    "item"
);
numeric_id!(
    /// Identity of a project-scoped state.
    StateId,
    "state"
);
numeric_id!(
    /// Identity of an iteration. Values `<= 0` mean "backlog".
    IterationId,
    "iteration"
);
numeric_id!(
    /// Identity of a project.
    ProjectId,
    "project"
);

impl ItemId {
    /// Placeholder reported for an item rejected before it was stored.
    pub const UNSAVED: Self = Self(0);
}

impl IterationId {
    /// Sentinel for items sitting in the backlog.
    pub const UNASSIGNED: Self = Self(-1);

    /// Returns the id when it names a real iteration.
    #[must_use]
    pub const fn assigned(self) -> Option<Self> {
        if self.0 > 0 { Some(self) } else { None }
    }

    #[must_use]
    pub const fn is_assigned(self) -> bool {
        self.0 > 0
    }
}

impl Default for IterationId {
    fn default() -> Self {
        Self::UNASSIGNED
    }
}
