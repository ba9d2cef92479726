//! Core authorization types

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{AuthzError, Result};

/// Telegram user identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    /// Wrap a raw id without validation
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Wrap a raw id, rejecting zero and negative values
    pub fn parse(id: i64) -> Result<Self> {
        if id <= 0 {
            return Err(AuthzError::InvalidUserId(id));
        }
        Ok(Self(id))
    }

    /// Raw id value
    pub const fn get(self) -> i64 {
        self.0
    }

    /// Whether the id can refer to a real user
    pub const fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Permission level held by a user
///
/// Variants are declared in ascending order so the derived `Ord` is the
/// permission hierarchy: `Admin > Coordinator > Viewer > None`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// No access
    #[default]
    None,
    /// Read-only roster access
    Viewer,
    /// Roster editing and exports
    Coordinator,
    /// Everything, including role administration
    Admin,
}

impl Role {
    /// All roles, lowest first
    pub const ALL: [Role; 4] = [Role::None, Role::Viewer, Role::Coordinator, Role::Admin];

    /// Whether this role grants everything `required` grants
    pub fn satisfies(self, required: Role) -> bool {
        self >= required
    }

    /// Lowercase name used in logs and config files
    pub fn as_str(self) -> &'static str {
        match self {
            Role::None => "none",
            Role::Viewer => "viewer",
            Role::Coordinator => "coordinator",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Role::None),
            "viewer" => Ok(Role::Viewer),
            "coordinator" => Ok(Role::Coordinator),
            "admin" => Ok(Role::Admin),
            other => Err(AuthzError::InvalidRole(other.to_string())),
        }
    }
}

/// A user's role as held by the external roster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    /// User identifier
    pub user_id: UserId,

    /// Assigned role
    pub role: Role,
}

impl RoleAssignment {
    /// Create a new assignment
    pub fn new(user_id: impl Into<UserId>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
        }
    }
}

/// Protected action being performed (search, edit, export, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Action {
    /// Action name
    pub name: String,
}

impl Action {
    /// Create a new action
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Action name
    pub fn as_str(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl From<&str> for Action {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Minimum role required per action
///
/// Actions missing from the table require `fallback` (Admin by default), so a
/// newly added bot command is locked down until someone lists it here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionPolicy {
    /// Action name -> required role
    #[serde(default)]
    pub required: HashMap<String, Role>,

    /// Required role for unlisted actions
    #[serde(default = "default_fallback_role")]
    pub fallback: Role,
}

fn default_fallback_role() -> Role {
    Role::Admin
}

impl ActionPolicy {
    /// Empty policy: every action requires the fallback role
    pub fn new() -> Self {
        Self {
            required: HashMap::new(),
            fallback: Role::Admin,
        }
    }

    /// Set the required role for an action
    pub fn with_action(mut self, action: impl Into<String>, role: Role) -> Self {
        self.required.insert(action.into(), role);
        self
    }

    /// Required role for `action`
    pub fn required_role(&self, action: &Action) -> Role {
        self.required
            .get(action.as_str())
            .copied()
            .unwrap_or(self.fallback)
    }
}

impl Default for ActionPolicy {
    /// Roster bot command set
    fn default() -> Self {
        Self::new()
            .with_action("search", Role::Viewer)
            .with_action("view", Role::Viewer)
            .with_action("edit", Role::Coordinator)
            .with_action("add_participant", Role::Coordinator)
            .with_action("export", Role::Coordinator)
            .with_action("sync", Role::Admin)
            .with_action("invalidate", Role::Admin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_total_order() {
        assert!(Role::Admin > Role::Coordinator);
        assert!(Role::Coordinator > Role::Viewer);
        assert!(Role::Viewer > Role::None);

        let mut roles = vec![Role::Coordinator, Role::None, Role::Admin, Role::Viewer];
        roles.sort();
        assert_eq!(roles, Role::ALL.to_vec());
    }

    #[test]
    fn test_role_satisfies() {
        assert!(Role::Admin.satisfies(Role::Viewer));
        assert!(Role::Coordinator.satisfies(Role::Coordinator));
        assert!(!Role::Viewer.satisfies(Role::Coordinator));
        assert!(!Role::None.satisfies(Role::Viewer));
        assert!(Role::None.satisfies(Role::None));
    }

    #[test]
    fn test_role_parse() {
        assert_eq!("Admin".parse::<Role>().unwrap(), Role::Admin);
        assert_eq!(" coordinator ".parse::<Role>().unwrap(), Role::Coordinator);
        assert_eq!("none".parse::<Role>().unwrap(), Role::None);
        assert!("superuser".parse::<Role>().is_err());
        assert!(matches!("".parse::<Role>(), Err(AuthzError::InvalidRole(_))));
        assert!("  ".parse::<Role>().is_err());
    }

    #[test]
    fn test_role_serde_lowercase() {
        let json = serde_json::to_string(&Role::Coordinator).unwrap();
        assert_eq!(json, "\"coordinator\"");
        let role: Role = serde_json::from_str("\"viewer\"").unwrap();
        assert_eq!(role, Role::Viewer);
    }

    #[test]
    fn test_user_id_validation() {
        assert!(UserId::parse(42).is_ok());
        assert!(matches!(UserId::parse(0), Err(AuthzError::InvalidUserId(0))));
        assert!(UserId::parse(-7).is_err());
        assert!(!UserId::new(-1).is_valid());
    }

    #[test]
    fn test_action_policy_lookup() {
        let policy = ActionPolicy::default();
        assert_eq!(policy.required_role(&Action::new("search")), Role::Viewer);
        assert_eq!(policy.required_role(&Action::new("export")), Role::Coordinator);
        assert_eq!(policy.required_role(&Action::new("drop_table")), Role::Admin);
    }
}
