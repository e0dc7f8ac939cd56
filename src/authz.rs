//! Role-based access decision

use std::collections::BTreeSet;

/// Result of an access check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Request may proceed
    Allow,
    /// Caller holds none of the required roles
    Forbidden,
}

/// Allow if the route is public or the caller holds at least one required role.
#[must_use]
pub fn authorize(required: &BTreeSet<String>, user: &BTreeSet<String>) -> Decision {
    if required.is_empty() || !required.is_disjoint(user) {
        Decision::Allow
    } else {
        Decision::Forbidden
    }
}
