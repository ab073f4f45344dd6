// Role definitions

use std::collections::BTreeSet;
use std::fmt;

/// A role (participant) in a choreography.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Role(String);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Role(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Role {
    fn from(name: &str) -> Self {
        Role::new(name)
    }
}

/// An unordered, duplicate-free collection of roles.
pub type RoleSet = BTreeSet<Role>;

/// Build a role set from anything iterable.
pub fn role_set<I, R>(roles: I) -> RoleSet
where
    I: IntoIterator<Item = R>,
    R: Into<Role>,
{
    roles.into_iter().map(Into::into).collect()
}

/// Render an ordered role scope for messages: `[A B C]`.
pub fn scope_string(roles: &[Role]) -> String {
    let names: Vec<&str> = roles.iter().map(Role::name).collect();
    format!("[{}]", names.join(" "))
}
