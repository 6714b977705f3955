//! # Scope Filter
//!
//! Produces the view of a policy that is relevant to one scope. Rules whose
//! action type is not bound are dropped. Atomic constraints whose key is not
//! bound are dropped. Logical constraints keep their bound children and are
//! dropped when none remain.

use crate::binding::RuleBindingRegistry;
use crate::model::{Constraint, Duty, Permission, Policy, Prohibition};

/// Applies a [`RuleBindingRegistry`] to policies.
#[derive(Debug, Clone, Copy)]
pub struct ScopeFilter<'a> {
    registry: &'a RuleBindingRegistry,
}

impl<'a> ScopeFilter<'a> {
    /// A filter backed by `registry`.
    pub fn new(registry: &'a RuleBindingRegistry) -> Self {
        Self { registry }
    }

    /// The subset of `policy` bound to `scope`.
    pub fn apply_scope(&self, policy: &Policy, scope: &str) -> Policy {
        Policy {
            permissions: policy
                .permissions
                .iter()
                .filter_map(|p| self.permission(p, scope))
                .collect(),
            prohibitions: policy
                .prohibitions
                .iter()
                .filter_map(|p| self.prohibition(p, scope))
                .collect(),
            obligations: policy
                .obligations
                .iter()
                .filter_map(|d| self.duty(d, scope))
                .collect(),
            target: policy.target.clone(),
            assigner: policy.assigner.clone(),
            assignee: policy.assignee.clone(),
            extensible_properties: policy.extensible_properties.clone(),
        }
    }

    fn permission(&self, permission: &Permission, scope: &str) -> Option<Permission> {
        if !self.registry.is_in_scope(&permission.action.action_type, scope) {
            return None;
        }
        Some(Permission {
            action: permission.action.clone(),
            constraints: self.constraints(&permission.constraints, scope),
            duties: permission
                .duties
                .iter()
                .filter_map(|d| self.duty(d, scope))
                .collect(),
        })
    }

    fn prohibition(&self, prohibition: &Prohibition, scope: &str) -> Option<Prohibition> {
        if !self.registry.is_in_scope(&prohibition.action.action_type, scope) {
            return None;
        }
        Some(Prohibition {
            action: prohibition.action.clone(),
            constraints: self.constraints(&prohibition.constraints, scope),
        })
    }

    fn duty(&self, duty: &Duty, scope: &str) -> Option<Duty> {
        if !self.registry.is_in_scope(&duty.action.action_type, scope) {
            return None;
        }
        Some(Duty {
            action: duty.action.clone(),
            constraints: self.constraints(&duty.constraints, scope),
        })
    }

    fn constraints(&self, constraints: &[Constraint], scope: &str) -> Vec<Constraint> {
        constraints
            .iter()
            .filter_map(|c| self.constraint(c, scope))
            .collect()
    }

    fn constraint(&self, constraint: &Constraint, scope: &str) -> Option<Constraint> {
        let rebuild = |children: &[Constraint], make: fn(Vec<Constraint>) -> Constraint| {
            let kept = self.constraints(children, scope);
            (!kept.is_empty()).then(|| make(kept))
        };
        match constraint {
            Constraint::Atomic { .. } => {
                let key = constraint.key()?;
                self.registry
                    .is_in_scope(key, scope)
                    .then(|| constraint.clone())
            }
            Constraint::And { constraints } => {
                rebuild(constraints, |constraints| Constraint::And { constraints })
            }
            Constraint::Or { constraints } => {
                rebuild(constraints, |constraints| Constraint::Or { constraints })
            }
            Constraint::Xone { constraints } => {
                rebuild(constraints, |constraints| Constraint::Xone { constraints })
            }
        }
    }
}
