//! # Rule Binding Registry
//!
//! Records which rule types (action types and constraint keys) are relevant
//! in which scopes. Anything not bound to the evaluated scope is removed by
//! the [`ScopeFilter`](crate::ScopeFilter) before evaluation.

use std::collections::{BTreeMap, BTreeSet};

/// Wildcard scope that matches every evaluation scope.
pub const ALL_SCOPES: &str = "*";

/// Whether something registered for `registered` applies when evaluating
/// `requested`.
///
/// Matching is by dot-delimited prefix: `a` applies to `a` and `a.b` but
/// not to `ab`.
pub fn scope_applies(registered: &str, requested: &str) -> bool {
    if registered == ALL_SCOPES {
        return true;
    }
    let requested = format!("{requested}.");
    let registered = format!("{registered}.");
    requested.starts_with(&registered)
}

/// Bindings of rule types to scopes.
#[derive(Debug, Clone, Default)]
pub struct RuleBindingRegistry {
    bindings: BTreeMap<String, BTreeSet<String>>,
}

impl RuleBindingRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `rule_type` to `scope`.
    pub fn bind(&mut self, rule_type: impl Into<String>, scope: impl Into<String>) {
        self.bindings
            .entry(rule_type.into())
            .or_default()
            .insert(scope.into());
    }

    /// Whether `rule_type` is bound to `scope` directly, through a parent
    /// scope, or through the wildcard.
    pub fn is_in_scope(&self, rule_type: &str, scope: &str) -> bool {
        self.bindings
            .get(rule_type)
            .is_some_and(|scopes| scopes.iter().any(|s| scope_applies(s, scope)))
    }

    /// Scopes `rule_type` is bound to.
    pub fn scopes_for(&self, rule_type: &str) -> impl Iterator<Item = &str> {
        self.bindings
            .get(rule_type)
            .into_iter()
            .flat_map(|s| s.iter().map(String::as_str))
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// A scope matches itself and its dot-delimited descendants only.
        #[test]
        fn scope_matches_itself_and_descendants(
            parent in "[a-z]{1,8}(\\.[a-z]{1,8}){0,2}",
            child in "[a-z]{1,8}",
        ) {
            let descendant = format!("{parent}.{child}");
            let sibling = format!("{parent}{child}");
            prop_assert!(scope_applies(&parent, &parent));
            prop_assert!(scope_applies(&parent, &descendant));
            prop_assert!(!scope_applies(&descendant, &parent));
            prop_assert!(!scope_applies(&parent, &sibling));
        }
    }
}
