//! Permission engine.
//!
//! Users belong to user-groups, documents are tagged with document-groups,
//! and a [`GroupPermission`] links the two with a [`PermissionLevel`].
//! [`check`] is a pure function of its inputs, so the same evaluation can be
//! reused by pull-sync filtering and by real-time broadcast filtering.
//!
//! Direct [`Permission`] grants (to a single user or group, for a whole
//! collection or a single item) are evaluated alongside group links by
//! [`AccessContext`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Group identifier, on either side of the permission graph.
pub type GroupId = String;

pub const REASON_NO_USER_GROUPS: &str = "user belongs to no groups";
pub const REASON_NO_DOCUMENT_GROUPS: &str = "item belongs to no groups";
pub const REASON_NO_LINK: &str = "no permission link";
pub const REASON_INSUFFICIENT_LEVEL: &str = "insufficient permission level";

/// Access level granted by a group link. Each level includes the ones below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    View,
    Edit,
    Manage,
    Owner,
}

impl PermissionLevel {
    /// Numeric value: view(1) < edit(2) < manage(3) < owner(4).
    pub fn value(self) -> i64 {
        match self {
            PermissionLevel::View => 1,
            PermissionLevel::Edit => 2,
            PermissionLevel::Manage => 3,
            PermissionLevel::Owner => 4,
        }
    }

    pub fn from_value(value: i64) -> Option<Self> {
        match value {
            1 => Some(PermissionLevel::View),
            2 => Some(PermissionLevel::Edit),
            3 => Some(PermissionLevel::Manage),
            4 => Some(PermissionLevel::Owner),
            _ => None,
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionLevel::View => write!(f, "view"),
            PermissionLevel::Edit => write!(f, "edit"),
            PermissionLevel::Manage => write!(f, "manage"),
            PermissionLevel::Owner => write!(f, "owner"),
        }
    }
}

impl FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "view" => Ok(PermissionLevel::View),
            "edit" => Ok(PermissionLevel::Edit),
            "manage" => Ok(PermissionLevel::Manage),
            "owner" => Ok(PermissionLevel::Owner),
            _ => Err(format!(
                "Invalid permission level '{}'. Valid options: view, edit, manage, owner",
                s
            )),
        }
    }
}

/// Action a caller wants to perform on a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
    Delete,
    Admin,
}

impl Action {
    /// Minimum group level that grants this action.
    pub fn required_level(self) -> PermissionLevel {
        match self {
            Action::Read => PermissionLevel::View,
            Action::Write => PermissionLevel::Edit,
            Action::Delete => PermissionLevel::Manage,
            Action::Admin => PermissionLevel::Owner,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Read => write!(f, "read"),
            Action::Write => write!(f, "write"),
            Action::Delete => write!(f, "delete"),
            Action::Admin => write!(f, "admin"),
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "read" => Ok(Action::Read),
            "write" => Ok(Action::Write),
            "delete" => Ok(Action::Delete),
            "admin" => Ok(Action::Admin),
            _ => Err(format!(
                "Invalid action '{}'. Valid options: read, write, delete, admin",
                s
            )),
        }
    }
}

/// Link from a user-group to a document-group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPermission {
    pub user_group_id: GroupId,
    pub document_group_id: GroupId,
    pub level: PermissionLevel,
}

impl GroupPermission {
    pub fn new(
        user_group_id: impl Into<GroupId>,
        document_group_id: impl Into<GroupId>,
        level: PermissionLevel,
    ) -> Self {
        Self {
            user_group_id: user_group_id.into(),
            document_group_id: document_group_id.into(),
            level,
        }
    }
}

/// Outcome of a permission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionCheck {
    pub allowed: bool,
    /// Highest matching level, when any link matched.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<PermissionLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionCheck {
    fn deny(reason: &str, level: Option<PermissionLevel>) -> Self {
        Self {
            allowed: false,
            level,
            reason: Some(reason.to_string()),
        }
    }
}

/// Evaluates whether `user_group_ids` may act at `required` level on an item
/// tagged with `document_group_ids`.
///
/// An item must be explicitly grouped to be visible: an empty
/// `document_group_ids` denies even if a link would otherwise match.
pub fn check(
    user_group_ids: &BTreeSet<GroupId>,
    document_group_ids: &BTreeSet<GroupId>,
    permissions: &[GroupPermission],
    required: PermissionLevel,
) -> PermissionCheck {
    if user_group_ids.is_empty() {
        return PermissionCheck::deny(REASON_NO_USER_GROUPS, None);
    }
    if document_group_ids.is_empty() {
        return PermissionCheck::deny(REASON_NO_DOCUMENT_GROUPS, None);
    }

    let max_level = permissions
        .iter()
        .filter(|p| {
            user_group_ids.contains(&p.user_group_id)
                && document_group_ids.contains(&p.document_group_id)
        })
        .map(|p| p.level)
        .max();

    match max_level {
        None => PermissionCheck::deny(REASON_NO_LINK, None),
        Some(level) if level >= required => PermissionCheck {
            allowed: true,
            level: Some(level),
            reason: None,
        },
        Some(level) => PermissionCheck::deny(REASON_INSUFFICIENT_LEVEL, Some(level)),
    }
}

/// Who a direct [`Permission`] is granted to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum Principal {
    User(String),
    Group(GroupId),
}

/// Whether a direct permission covers a whole collection or one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionScope {
    Collection,
    Item,
}

/// Direct grant of actions on a collection (or a single item in it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub principal: Principal,
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub actions: BTreeSet<Action>,
    pub scope: PermissionScope,
}

impl Permission {
    /// Grant on every item in `collection`.
    pub fn for_collection(
        principal: Principal,
        collection: impl Into<String>,
        actions: impl IntoIterator<Item = Action>,
    ) -> Self {
        Self {
            principal,
            collection: collection.into(),
            item_id: None,
            actions: actions.into_iter().collect(),
            scope: PermissionScope::Collection,
        }
    }

    /// Grant on a single item.
    pub fn for_item(
        principal: Principal,
        collection: impl Into<String>,
        item_id: impl Into<String>,
        actions: impl IntoIterator<Item = Action>,
    ) -> Self {
        Self {
            principal,
            collection: collection.into(),
            item_id: Some(item_id.into()),
            actions: actions.into_iter().collect(),
            scope: PermissionScope::Item,
        }
    }

    /// True if the permission is granted to this user or one of their groups.
    pub fn is_held_by(&self, user_id: Option<&str>, user_group_ids: &BTreeSet<GroupId>) -> bool {
        match &self.principal {
            Principal::User(id) => user_id == Some(id.as_str()),
            Principal::Group(group) => user_group_ids.contains(group),
        }
    }

    /// True if the permission covers `item_id` in `collection`.
    pub fn covers(&self, collection: &str, item_id: &str) -> bool {
        if self.collection != collection {
            return false;
        }
        match self.scope {
            PermissionScope::Collection => true,
            PermissionScope::Item => self.item_id.as_deref() == Some(item_id),
        }
    }

    /// True if the action is in the set, or the set contains `admin`.
    pub fn grants(&self, action: Action) -> bool {
        self.actions.contains(&action) || self.actions.contains(&Action::Admin)
    }

    pub fn allows(
        &self,
        user_id: Option<&str>,
        user_group_ids: &BTreeSet<GroupId>,
        collection: &str,
        item_id: &str,
        action: Action,
    ) -> bool {
        self.is_held_by(user_id, user_group_ids)
            && self.covers(collection, item_id)
            && self.grants(action)
    }
}

/// A caller's resolved permissions, built once per request or session and
/// reused for every candidate document.
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    user_id: Option<String>,
    user_group_ids: BTreeSet<GroupId>,
    group_permissions: Vec<GroupPermission>,
    permissions: Vec<Permission>,
}

impl AccessContext {
    /// Builds a context, keeping only the links and grants this caller holds.
    pub fn new(
        user_id: Option<String>,
        user_group_ids: BTreeSet<GroupId>,
        group_permissions: Vec<GroupPermission>,
        permissions: Vec<Permission>,
    ) -> Self {
        let group_permissions = group_permissions
            .into_iter()
            .filter(|p| user_group_ids.contains(&p.user_group_id))
            .collect();
        let permissions = permissions
            .into_iter()
            .filter(|p| p.is_held_by(user_id.as_deref(), &user_group_ids))
            .collect();

        Self {
            user_id,
            user_group_ids,
            group_permissions,
            permissions,
        }
    }

    /// Context of an unauthenticated caller; sees nothing.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn user_group_ids(&self) -> &BTreeSet<GroupId> {
        &self.user_group_ids
    }

    /// False when nothing could ever be visible to this caller.
    pub fn has_any_access(&self) -> bool {
        !self.group_permissions.is_empty() || !self.permissions.is_empty()
    }

    /// Group-link evaluation for an item.
    pub fn check(
        &self,
        document_group_ids: &BTreeSet<GroupId>,
        required: PermissionLevel,
    ) -> PermissionCheck {
        check(
            &self.user_group_ids,
            document_group_ids,
            &self.group_permissions,
            required,
        )
    }

    /// Whether the caller may perform `action` on an item, through a group
    /// link or a direct grant.
    pub fn can_perform(
        &self,
        collection: &str,
        item_id: &str,
        document_group_ids: &BTreeSet<GroupId>,
        action: Action,
    ) -> bool {
        if self
            .check(document_group_ids, action.required_level())
            .allowed
        {
            return true;
        }
        self.permissions.iter().any(|p| {
            p.allows(
                self.user_id.as_deref(),
                &self.user_group_ids,
                collection,
                item_id,
                action,
            )
        })
    }

    pub fn can_view(
        &self,
        collection: &str,
        item_id: &str,
        document_group_ids: &BTreeSet<GroupId>,
    ) -> bool {
        self.can_perform(collection, item_id, document_group_ids, Action::Read)
    }
}
