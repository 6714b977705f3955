//! # Policy Model
//!
//! An immutable tree: a [`Policy`] holds permissions, prohibitions and
//! obligations; every rule names an [`Action`] and carries zero or more
//! [`Constraint`]s. Constraints are either atomic comparisons
//! (`left operator right`) or logical combinations of sub-constraints.
//!
//! Operands are literal JSON values. The left operand of an atomic
//! constraint is conventionally a string key (for example
//! `"absoluteSpatialPosition"`) which selects the constraint function.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The action a rule governs, such as `USE`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    /// Action type key.
    pub action_type: String,
}

impl Action {
    /// Create an action of the given type.
    pub fn new(action_type: impl Into<String>) -> Self {
        Self {
            action_type: action_type.into(),
        }
    }
}

/// Comparison operator of an atomic constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operator {
    /// Equal.
    Eq,
    /// Not equal.
    Neq,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Geq,
    /// Less than.
    Lt,
    /// Less than or equal.
    Leq,
    /// Left is contained in the right-hand array.
    In,
}

impl Operator {
    /// Compare `left` against `right`.
    ///
    /// Ordering operators compare numbers numerically and everything else
    /// by string form. `In` requires `right` to be an array.
    pub fn apply(self, left: &Value, right: &Value) -> bool {
        use std::cmp::Ordering;

        let ordering = || match (left.as_f64(), right.as_f64()) {
            (Some(l), Some(r)) => l.partial_cmp(&r),
            _ => Some(text(left).cmp(&text(right))),
        };
        match self {
            Self::Eq => left == right || text(left) == text(right),
            Self::Neq => !(left == right || text(left) == text(right)),
            Self::Gt => ordering() == Some(Ordering::Greater),
            Self::Geq => matches!(ordering(), Some(Ordering::Greater | Ordering::Equal)),
            Self::Lt => ordering() == Some(Ordering::Less),
            Self::Leq => matches!(ordering(), Some(Ordering::Less | Ordering::Equal)),
            Self::In => right
                .as_array()
                .is_some_and(|items| items.iter().any(|i| Self::Eq.apply(left, i))),
        }
    }
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Eq => "EQ",
            Self::Neq => "NEQ",
            Self::Gt => "GT",
            Self::Geq => "GEQ",
            Self::Lt => "LT",
            Self::Leq => "LEQ",
            Self::In => "IN",
        };
        f.write_str(s)
    }
}

/// A constraint on a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Constraint {
    /// `left operator right`.
    Atomic {
        /// Left operand, usually the constraint key.
        left: Value,
        /// Comparison operator.
        operator: Operator,
        /// Right operand.
        right: Value,
    },
    /// All sub-constraints must hold.
    And {
        /// Sub-constraints.
        constraints: Vec<Constraint>,
    },
    /// At least one sub-constraint must hold.
    Or {
        /// Sub-constraints.
        constraints: Vec<Constraint>,
    },
    /// Exactly one sub-constraint must hold.
    Xone {
        /// Sub-constraints.
        constraints: Vec<Constraint>,
    },
}

impl Constraint {
    /// Build an atomic constraint with a string key on the left.
    pub fn atomic(key: impl Into<String>, operator: Operator, right: impl Into<Value>) -> Self {
        Self::Atomic {
            left: Value::String(key.into()),
            operator,
            right: right.into(),
        }
    }

    /// The constraint key of an atomic constraint, if its left operand is a
    /// string.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Atomic { left, .. } => left.as_str(),
            _ => None,
        }
    }
}

/// A permission to perform an action, possibly carrying duties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    /// Permitted action.
    pub action: Action,
    /// Conditions under which the permission holds.
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Duties that must be fulfilled for the permission to hold.
    #[serde(default)]
    pub duties: Vec<Duty>,
}

impl Permission {
    /// A permission for `action` with no constraints.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            constraints: Vec::new(),
            duties: Vec::new(),
        }
    }

    /// Add a constraint.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Add a duty.
    pub fn with_duty(mut self, duty: Duty) -> Self {
        self.duties.push(duty);
        self
    }
}

/// A prohibition of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prohibition {
    /// Prohibited action.
    pub action: Action,
    /// Conditions under which the prohibition applies.
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Prohibition {
    /// A prohibition of `action` with no constraints.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            constraints: Vec::new(),
        }
    }

    /// Add a constraint.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

/// An obligation to perform an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Duty {
    /// Required action.
    pub action: Action,
    /// Conditions of the duty.
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl Duty {
    /// A duty to perform `action` with no constraints.
    pub fn new(action: Action) -> Self {
        Self {
            action,
            constraints: Vec::new(),
        }
    }

    /// Add a constraint.
    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }
}

/// Borrowed view of any rule, handed to rule and constraint functions.
#[derive(Debug, Clone, Copy)]
pub enum RuleRef<'a> {
    /// A permission.
    Permission(&'a Permission),
    /// A prohibition.
    Prohibition(&'a Prohibition),
    /// A duty.
    Duty(&'a Duty),
}

impl<'a> RuleRef<'a> {
    /// The rule's action.
    pub fn action(&self) -> &'a Action {
        match self {
            Self::Permission(p) => &p.action,
            Self::Prohibition(p) => &p.action,
            Self::Duty(d) => &d.action,
        }
    }

    /// The rule's constraints.
    pub fn constraints(&self) -> &'a [Constraint] {
        match self {
            Self::Permission(p) => &p.constraints,
            Self::Prohibition(p) => &p.constraints,
            Self::Duty(d) => &d.constraints,
        }
    }
}

/// An immutable usage policy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    /// Permissions granted.
    #[serde(default)]
    pub permissions: Vec<Permission>,
    /// Prohibitions imposed.
    #[serde(default)]
    pub prohibitions: Vec<Prohibition>,
    /// Policy-level obligations.
    #[serde(default)]
    pub obligations: Vec<Duty>,
    /// Asset the policy is attached to, if any.
    #[serde(default)]
    pub target: Option<String>,
    /// Party granting the policy.
    #[serde(default)]
    pub assigner: Option<String>,
    /// Party receiving the policy.
    #[serde(default)]
    pub assignee: Option<String>,
    /// Free-form extension properties.
    #[serde(default)]
    pub extensible_properties: BTreeMap<String, Value>,
}

impl Policy {
    /// An empty policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a permission.
    pub fn with_permission(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }

    /// Add a prohibition.
    pub fn with_prohibition(mut self, prohibition: Prohibition) -> Self {
        self.prohibitions.push(prohibition);
        self
    }

    /// Add a policy-level obligation.
    pub fn with_obligation(mut self, duty: Duty) -> Self {
        self.obligations.push(duty);
        self
    }

    /// Set the target asset.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operator_comparisons() {
        assert!(Operator::Eq.apply(&json!("eu"), &json!("eu")));
        assert!(Operator::Neq.apply(&json!("eu"), &json!("us")));
        assert!(Operator::Gt.apply(&json!(5), &json!(3)));
        assert!(Operator::Geq.apply(&json!(3), &json!(3)));
        assert!(Operator::Lt.apply(&json!("a"), &json!("b")));
        assert!(Operator::Leq.apply(&json!(2.5), &json!(3)));
        assert!(Operator::In.apply(&json!("eu"), &json!(["us", "eu"])));
        assert!(!Operator::In.apply(&json!("eu"), &json!("eu")));
    }

    #[test]
    fn eq_tolerates_string_number_mismatch() {
        assert!(Operator::Eq.apply(&json!(42), &json!("42")));
    }

    #[test]
    fn constraint_key_only_for_atomic() {
        let atomic = Constraint::atomic("region", Operator::Eq, "eu");
        assert_eq!(atomic.key(), Some("region"));
        let and = Constraint::And {
            constraints: vec![atomic],
        };
        assert_eq!(and.key(), None);
    }

    #[test]
    fn policy_serde_shape() {
        let policy = Policy::new()
            .with_permission(
                Permission::new(Action::new("USE"))
                    .with_constraint(Constraint::atomic("region", Operator::Eq, "eu")),
            )
            .with_target("asset-1");
        let json = serde_json::to_value(&policy).unwrap();
        assert_eq!(json["permissions"][0]["action"]["actionType"], "USE");
        assert_eq!(json["permissions"][0]["constraints"][0]["type"], "atomic");
        assert_eq!(json["permissions"][0]["constraints"][0]["operator"], "EQ");
        let back: Policy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }

    #[test]
    fn rule_ref_exposes_action_and_constraints() {
        let duty = Duty::new(Action::new("NOTIFY"))
            .with_constraint(Constraint::atomic("channel", Operator::Eq, "email"));
        let rule = RuleRef::Duty(&duty);
        assert_eq!(rule.action().action_type, "NOTIFY");
        assert_eq!(rule.constraints().len(), 1);
    }
}
