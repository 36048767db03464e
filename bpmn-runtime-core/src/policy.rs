//! Transition guards.
//!
//! A policy is evaluated against a work item before a transition is applied
//! and may veto it. Policies are stateless from the engine's point of view
//! and are carried by each `WorkItemTransition`.

use crate::work_item::WorkItem;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Guard that may veto a work item transition.
pub trait Policy: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;

    /// `Err(reason)` vetoes the transition.
    fn enforce(&self, work_item: &WorkItem) -> Result<(), String>;

    /// The identity acting through this policy, if it carries one.
    fn identity(&self) -> Option<&Identity> {
        None
    }
}

pub type SharedPolicy = Arc<dyn Policy>;

// ─── Identity ─────────────────────────────────────────────────

/// The user performing an operation, with the groups/roles they belong to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user: String,
    pub roles: BTreeSet<String>,
}

impl Identity {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            roles: BTreeSet::new(),
        }
    }

    pub fn with_roles(mut self, roles: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    pub fn has_any_role(&self, roles: &BTreeSet<String>) -> bool {
        !self.roles.is_disjoint(roles)
    }
}

// ─── SecurityPolicy ───────────────────────────────────────────

/// Work item parameter: users allowed to act on the item.
pub const ACTOR_ID_PARAM: &str = "ActorId";
/// Work item parameter: groups allowed to act on the item.
pub const GROUP_ID_PARAM: &str = "GroupId";
/// Work item parameter: users never allowed to act on the item.
pub const EXCLUDED_OWNER_PARAM: &str = "ExcludedOwnerId";
/// Work item parameter: administrators who bypass assignment checks.
pub const ADMIN_USERS_PARAM: &str = "BusinessAdministratorId";
/// Work item parameter: administrator groups.
pub const ADMIN_GROUPS_PARAM: &str = "BusinessAdministratorGroupId";

/// Assignment guard for human-task style work items.
///
/// Evaluation order:
/// 1. administrators (user or group) always pass
/// 2. the actual owner always passes
/// 3. excluded users are rejected
/// 4. potential users / potential groups pass
/// 5. an item with no owner and no assignment at all passes
/// 6. anything else is rejected
#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    identity: Identity,
}

impl SecurityPolicy {
    pub fn of(identity: Identity) -> Self {
        Self { identity }
    }

    pub fn shared(identity: Identity) -> SharedPolicy {
        Arc::new(Self::of(identity))
    }
}

impl Policy for SecurityPolicy {
    fn name(&self) -> &str {
        "security"
    }

    fn enforce(&self, work_item: &WorkItem) -> Result<(), String> {
        let user = &self.identity.user;

        let admins = assignment_set(work_item, ADMIN_USERS_PARAM);
        let admin_groups = assignment_set(work_item, ADMIN_GROUPS_PARAM);
        if admins.contains(user) || self.identity.has_any_role(&admin_groups) {
            return Ok(());
        }

        if work_item.actual_owner.as_deref() == Some(user.as_str()) {
            return Ok(());
        }

        if assignment_set(work_item, EXCLUDED_OWNER_PARAM).contains(user) {
            return Err(format!("user '{user}' is excluded from this task"));
        }

        let potential_users = assignment_set(work_item, ACTOR_ID_PARAM);
        let potential_groups = assignment_set(work_item, GROUP_ID_PARAM);
        if let Some(owner) = &work_item.actual_owner {
            return Err(format!("task is owned by '{owner}', not '{user}'"));
        }
        if potential_users.contains(user) || self.identity.has_any_role(&potential_groups) {
            return Ok(());
        }
        if potential_users.is_empty() && potential_groups.is_empty() {
            return Ok(());
        }

        Err(format!("user '{user}' is not a potential owner"))
    }

    fn identity(&self) -> Option<&Identity> {
        Some(&self.identity)
    }
}

/// Read an assignment parameter given either as a comma separated string or
/// as a JSON array of strings.
fn assignment_set(work_item: &WorkItem, param: &str) -> BTreeSet<String> {
    match work_item.parameters.get(param) {
        Some(Value::String(s)) => s
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => BTreeSet::new(),
    }
}

// ─── FnPolicy ─────────────────────────────────────────────────

type PolicyFn = dyn Fn(&WorkItem) -> Result<(), String> + Send + Sync;

/// Closure-backed policy for ad-hoc guards.
pub struct FnPolicy {
    name: String,
    check: Box<PolicyFn>,
}

impl FnPolicy {
    pub fn new(
        name: impl Into<String>,
        check: impl Fn(&WorkItem) -> Result<(), String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            check: Box::new(check),
        }
    }
}

impl fmt::Debug for FnPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPolicy").field("name", &self.name).finish()
    }
}

impl Policy for FnPolicy {
    fn name(&self) -> &str {
        &self.name
    }

    fn enforce(&self, work_item: &WorkItem) -> Result<(), String> {
        (self.check)(work_item)
    }
}
