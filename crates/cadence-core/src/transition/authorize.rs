//! Authorization layered over structural buttons.

use std::collections::{HashMap, HashSet};

use crate::model::{ItemType, ProjectId, StateId, WorkItem};

use super::graph::Button;

/// Who is asking.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub user_id: String,
    /// Engine-internal callers (cascades, background jobs).
    pub internal: bool,
}

impl Identity {
    #[must_use]
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            internal: false,
        }
    }

    /// The identity cascades act under.
    #[must_use]
    pub fn system() -> Self {
        Self {
            user_id: "system".to_string(),
            internal: true,
        }
    }
}

/// Permission collaborator.
pub trait Authorizer: Send + Sync {
    /// May `identity` move an item of `item_type` in `project` from `from`
    /// to `to`?
    ///
    /// # Errors
    ///
    /// Any error is treated as a denial by the engine.
    fn check_transition(
        &self,
        identity: &Identity,
        project: ProjectId,
        item_type: ItemType,
        from: StateId,
        to: StateId,
    ) -> anyhow::Result<bool>;
}

/// Permits everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn check_transition(
        &self,
        _identity: &Identity,
        _project: ProjectId,
        _item_type: ItemType,
        _from: StateId,
        _to: StateId,
    ) -> anyhow::Result<bool> {
        Ok(true)
    }
}

/// Deny-list policy: targets listed for everybody, or for one user.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicy {
    denied: HashSet<(ItemType, StateId)>,
    denied_for_user: HashSet<(String, ItemType, StateId)>,
}

impl StaticPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn deny(mut self, item_type: ItemType, to: StateId) -> Self {
        self.denied.insert((item_type, to));
        self
    }

    #[must_use]
    pub fn deny_user(mut self, user_id: impl Into<String>, item_type: ItemType, to: StateId) -> Self {
        self.denied_for_user.insert((user_id.into(), item_type, to));
        self
    }
}

impl Authorizer for StaticPolicy {
    fn check_transition(
        &self,
        identity: &Identity,
        _project: ProjectId,
        item_type: ItemType,
        _from: StateId,
        to: StateId,
    ) -> anyhow::Result<bool> {
        let denied = self.denied.contains(&(item_type, to))
            || self
                .denied_for_user
                .contains(&(identity.user_id.clone(), item_type, to));
        Ok(!denied)
    }
}

type PermissionKey = (ProjectId, ItemType, StateId);

/// Identity plus the permission memo of one cascade chain or one rendered
/// page of items.
///
/// Each chain owns its context; contexts are never shared between chains.
#[derive(Debug)]
pub struct AuthContext {
    identity: Identity,
    system_bypass: bool,
    memo: HashMap<PermissionKey, bool>,
    authorizer_calls: usize,
}

impl AuthContext {
    #[must_use]
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            system_bypass: true,
            memo: HashMap::new(),
            authorizer_calls: 0,
        }
    }

    #[must_use]
    pub fn system() -> Self {
        Self::new(Identity::system())
    }

    /// When disabled, internal identities go through the authorizer too.
    #[must_use]
    pub const fn with_system_bypass(mut self, enabled: bool) -> Self {
        self.system_bypass = enabled;
        self
    }

    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Number of times the authorizer was actually consulted.
    #[must_use]
    pub const fn authorizer_calls(&self) -> usize {
        self.authorizer_calls
    }

    /// Decide one transition, consulting the memo first.
    ///
    /// The no-op transition needs no permission.
    pub fn permits(
        &mut self,
        authorizer: &dyn Authorizer,
        project: ProjectId,
        item_type: ItemType,
        from: StateId,
        to: StateId,
    ) -> bool {
        if from == to || (self.identity.internal && self.system_bypass) {
            return true;
        }

        let key = (project, item_type, to);
        if let Some(&allowed) = self.memo.get(&key) {
            return allowed;
        }

        self.authorizer_calls += 1;
        let allowed = match authorizer.check_transition(&self.identity, project, item_type, from, to)
        {
            Ok(allowed) => allowed,
            Err(err) => {
                tracing::warn!(
                    user = %self.identity.user_id,
                    %project,
                    %item_type,
                    %from,
                    %to,
                    error = %err,
                    "authorization check failed; treating as denied"
                );
                false
            }
        };
        self.memo.insert(key, allowed);
        allowed
    }
}

/// Narrow structurally-legal buttons down to what the caller may take.
///
/// Denials and authorizer failures only clear the affected button.
pub fn authorize(
    buttons: &mut [Button],
    ctx: &mut AuthContext,
    authorizer: &dyn Authorizer,
    item: &WorkItem,
) {
    for button in buttons.iter_mut().filter(|b| b.permission) {
        button.permission = ctx.permits(
            authorizer,
            item.project_id,
            item.item_type,
            item.state,
            button.state_id,
        );
    }
}
