//! # Policy Engine
//!
//! Evaluates a [`Policy`] for a [`ParticipantAgent`] within a scope.
//!
//! ## Registration
//!
//! Functions are registered explicitly at startup, keyed by
//! `(scope, rule kind)` for whole-rule functions and
//! `(scope, rule kind, constraint key)` for atomic-constraint functions.
//! A function registered for scope `a` also serves `a.b`; one registered
//! for `*` serves every scope.
//!
//! ## Evaluation
//!
//! 1. Pre-validators for the scope run against the unfiltered policy. A
//!    failing pre-validator stops evaluation.
//! 2. The policy is narrowed to the scope by the [`ScopeFilter`].
//! 3. Each remaining rule is evaluated:
//!    - a **permission** holds when all its constraints hold, all its duties
//!      hold, and every permission rule function returns `true`;
//!    - a **duty** (attached or policy-level) holds under the same terms;
//!    - a **prohibition** is violated when all its constraints hold and,
//!      if prohibition rule functions are registered for the scope, at
//!      least one of them returns `true`. A violated prohibition fails the
//!      evaluation regardless of any permission for the same action.
//! 4. An atomic constraint that survived scope filtering but has no
//!    registered function is unsatisfied and records a problem, so the
//!    evaluation fails.
//! 5. If no problem was recorded, post-validators for the scope run.
//!
//! Problems reported by functions through
//! [`PolicyContext::report_problem`] are appended to the failure, but only
//! a failing rule decides the outcome.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;

use crate::binding::{scope_applies, RuleBindingRegistry};
use crate::context::{ParticipantAgent, PolicyContext};
use crate::model::{Constraint, Duty, Operator, Permission, Policy, Prohibition, RuleRef};
use crate::scope::ScopeFilter;

/// A function evaluating a rule as a whole.
pub type RuleFunction = Arc<dyn Fn(RuleRef<'_>, &mut PolicyContext) -> bool + Send + Sync>;

/// A function evaluating one atomic constraint: `(operator, right, rule, ctx)`.
pub type ConstraintFunction =
    Arc<dyn Fn(Operator, &Value, RuleRef<'_>, &mut PolicyContext) -> bool + Send + Sync>;

/// A validator run before or after rule evaluation.
pub type PolicyValidator = Arc<dyn Fn(&Policy, &mut PolicyContext) -> bool + Send + Sync>;

/// Kind of rule a function applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleKind {
    /// Permissions.
    Permission,
    /// Prohibitions.
    Prohibition,
    /// Duties, attached or policy-level.
    Duty,
}

impl RuleKind {
    fn of(rule: RuleRef<'_>) -> Self {
        match rule {
            RuleRef::Permission(_) => Self::Permission,
            RuleRef::Prohibition(_) => Self::Prohibition,
            RuleRef::Duty(_) => Self::Duty,
        }
    }
}

/// Evaluation failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// The policy does not grant access in the scope.
    #[error("policy denied in scope '{scope}': {}", problems.join("; "))]
    Denied {
        /// Evaluated scope.
        scope: String,
        /// Reasons, rule problems first.
        problems: Vec<String>,
    },
}

impl PolicyError {
    /// Reasons for the failure.
    pub fn problems(&self) -> &[String] {
        match self {
            Self::Denied { problems, .. } => problems,
        }
    }
}

// ---------------------------------------------------------------------------
// PolicyEngine
// ---------------------------------------------------------------------------

/// Scope-aware policy evaluator with an explicit function registry.
///
/// Registration takes `&mut self` and happens at startup; evaluation takes
/// `&self`, so a configured engine is shared as `Arc<PolicyEngine>`.
#[derive(Default)]
pub struct PolicyEngine {
    bindings: RuleBindingRegistry,
    rule_functions: BTreeMap<(String, RuleKind), Vec<RuleFunction>>,
    constraint_functions: BTreeMap<(String, RuleKind, String), Vec<ConstraintFunction>>,
    pre_validators: Vec<(String, PolicyValidator)>,
    post_validators: Vec<(String, PolicyValidator)>,
}

impl PolicyEngine {
    /// An engine with no bindings and no functions.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an action type or constraint key to a scope.
    pub fn bind(&mut self, rule_type: impl Into<String>, scope: impl Into<String>) {
        self.bindings.bind(rule_type, scope);
    }

    /// The rule binding registry.
    pub fn bindings(&self) -> &RuleBindingRegistry {
        &self.bindings
    }

    /// Register a function that evaluates whole rules of `kind`.
    pub fn register_rule_function<F>(&mut self, scope: impl Into<String>, kind: RuleKind, f: F)
    where
        F: Fn(RuleRef<'_>, &mut PolicyContext) -> bool + Send + Sync + 'static,
    {
        self.rule_functions
            .entry((scope.into(), kind))
            .or_default()
            .push(Arc::new(f));
    }

    /// Register a function for atomic constraints keyed `key` on rules of
    /// `kind`.
    pub fn register_constraint_function<F>(
        &mut self,
        scope: impl Into<String>,
        kind: RuleKind,
        key: impl Into<String>,
        f: F,
    ) where
        F: Fn(Operator, &Value, RuleRef<'_>, &mut PolicyContext) -> bool + Send + Sync + 'static,
    {
        self.constraint_functions
            .entry((scope.into(), kind, key.into()))
            .or_default()
            .push(Arc::new(f));
    }

    /// Register a validator run before rule evaluation.
    pub fn register_pre_validator<F>(&mut self, scope: impl Into<String>, f: F)
    where
        F: Fn(&Policy, &mut PolicyContext) -> bool + Send + Sync + 'static,
    {
        self.pre_validators.push((scope.into(), Arc::new(f)));
    }

    /// Register a validator run after successful rule evaluation.
    pub fn register_post_validator<F>(&mut self, scope: impl Into<String>, f: F)
    where
        F: Fn(&Policy, &mut PolicyContext) -> bool + Send + Sync + 'static,
    {
        self.post_validators.push((scope.into(), Arc::new(f)));
    }

    /// The part of `policy` that is relevant in `scope`.
    pub fn filter(&self, policy: &Policy, scope: &str) -> Policy {
        ScopeFilter::new(&self.bindings).apply_scope(policy, scope)
    }

    /// Evaluate `policy` for `agent` in `scope`.
    pub fn evaluate(
        &self,
        scope: &str,
        policy: &Policy,
        agent: &ParticipantAgent,
    ) -> Result<(), PolicyError> {
        let mut context = PolicyContext::new(agent.clone());
        self.evaluate_with_context(scope, policy, &mut context)
    }

    /// Evaluate with a caller-supplied context, so typed context data can be
    /// passed in and read back afterwards.
    pub fn evaluate_with_context(
        &self,
        scope: &str,
        policy: &Policy,
        context: &mut PolicyContext,
    ) -> Result<(), PolicyError> {
        for (registered, validator) in &self.pre_validators {
            if scope_applies(registered, scope) && !validator(policy, context) {
                return Err(self.denied(scope, Vec::new(), context, "pre-validator failed"));
            }
        }

        let filtered = self.filter(policy, scope);
        let mut evaluator = Evaluator {
            engine: self,
            scope,
            context,
            problems: Vec::new(),
        };
        evaluator.policy(&filtered);
        let Evaluator {
            problems, context, ..
        } = evaluator;

        if !problems.is_empty() {
            tracing::debug!(scope, problems = problems.len(), "policy evaluation denied");
            return Err(self.denied(scope, problems, context, "rule evaluation failed"));
        }

        for (registered, validator) in &self.post_validators {
            if scope_applies(registered, scope) && !validator(policy, context) {
                return Err(self.denied(scope, Vec::new(), context, "post-validator failed"));
            }
        }
        context.take_problems();
        Ok(())
    }

    fn denied(
        &self,
        scope: &str,
        mut problems: Vec<String>,
        context: &mut PolicyContext,
        fallback: &str,
    ) -> PolicyError {
        problems.extend(context.take_problems());
        if problems.is_empty() {
            problems.push(fallback.to_string());
        }
        PolicyError::Denied {
            scope: scope.to_string(),
            problems,
        }
    }

    fn rule_functions_for<'a>(
        &'a self,
        scope: &'a str,
        kind: RuleKind,
    ) -> impl Iterator<Item = &'a RuleFunction> + 'a {
        self.rule_functions
            .iter()
            .filter(move |((s, k), _)| *k == kind && scope_applies(s, scope))
            .flat_map(|(_, fs)| fs.iter())
    }

    fn constraint_functions_for<'a>(
        &'a self,
        scope: &'a str,
        kind: RuleKind,
        key: &'a str,
    ) -> impl Iterator<Item = &'a ConstraintFunction> + 'a {
        self.constraint_functions
            .iter()
            .filter(move |((s, k, c), _)| *k == kind && c == key && scope_applies(s, scope))
            .flat_map(|(_, fs)| fs.iter())
    }
}

impl std::fmt::Debug for PolicyEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEngine")
            .field("bindings", &self.bindings)
            .field("rule_functions", &self.rule_functions.len())
            .field("constraint_functions", &self.constraint_functions.len())
            .field("pre_validators", &self.pre_validators.len())
            .field("post_validators", &self.post_validators.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

struct Evaluator<'a> {
    engine: &'a PolicyEngine,
    scope: &'a str,
    context: &'a mut PolicyContext,
    problems: Vec<String>,
}

impl Evaluator<'_> {
    fn policy(&mut self, policy: &Policy) {
        for permission in &policy.permissions {
            self.permission(permission);
        }
        for prohibition in &policy.prohibitions {
            self.prohibition(prohibition);
        }
        for duty in &policy.obligations {
            self.duty(duty);
        }
    }

    fn permission(&mut self, permission: &Permission) -> bool {
        let rule = RuleRef::Permission(permission);
        let mut holds = self.all_constraints(&permission.constraints, rule);
        if !holds {
            self.problems.push(format!(
                "permission constraints not met for action '{}'",
                permission.action.action_type
            ));
        }
        for duty in &permission.duties {
            holds &= self.duty(duty);
        }
        if !self.rule_functions_pass(rule) {
            self.problems.push(format!(
                "permission rejected by rule function for action '{}'",
                permission.action.action_type
            ));
            holds = false;
        }
        holds
    }

    fn duty(&mut self, duty: &Duty) -> bool {
        let rule = RuleRef::Duty(duty);
        let constraints_hold = self.all_constraints(&duty.constraints, rule);
        let functions_pass = self.rule_functions_pass(rule);
        if !(constraints_hold && functions_pass) {
            self.problems.push(format!(
                "duty not fulfilled for action '{}'",
                duty.action.action_type
            ));
            return false;
        }
        true
    }

    fn prohibition(&mut self, prohibition: &Prohibition) {
        let rule = RuleRef::Prohibition(prohibition);
        let constraints_hold = self.all_constraints(&prohibition.constraints, rule);
        let functions: Vec<RuleFunction> = self
            .engine
            .rule_functions_for(self.scope, RuleKind::Prohibition)
            .cloned()
            .collect();
        let applies = if functions.is_empty() {
            constraints_hold
        } else {
            let mut any = false;
            for f in &functions {
                any |= f(rule, self.context);
            }
            constraints_hold && any
        };
        if applies {
            self.problems.push(format!(
                "action '{}' is prohibited",
                prohibition.action.action_type
            ));
        }
    }

    /// Every rule function for the rule's kind must return `true`.
    fn rule_functions_pass(&mut self, rule: RuleRef<'_>) -> bool {
        let functions: Vec<RuleFunction> = self
            .engine
            .rule_functions_for(self.scope, RuleKind::of(rule))
            .cloned()
            .collect();
        let mut pass = true;
        for f in &functions {
            pass &= f(rule, self.context);
        }
        pass
    }

    fn all_constraints(&mut self, constraints: &[Constraint], rule: RuleRef<'_>) -> bool {
        let mut holds = true;
        for c in constraints {
            holds &= self.constraint(c, rule);
        }
        holds
    }

    fn constraint(&mut self, constraint: &Constraint, rule: RuleRef<'_>) -> bool {
        match constraint {
            Constraint::Atomic {
                left,
                operator,
                right,
            } => self.atomic(left, *operator, right, rule),
            Constraint::And { constraints } => self.all_constraints(constraints, rule),
            Constraint::Or { constraints } => {
                let mut any = false;
                for c in constraints {
                    any |= self.constraint(c, rule);
                }
                any
            }
            Constraint::Xone { constraints } => {
                let mut count = 0usize;
                for c in constraints {
                    if self.constraint(c, rule) {
                        count += 1;
                    }
                }
                count == 1
            }
        }
    }

    fn atomic(&mut self, left: &Value, operator: Operator, right: &Value, rule: RuleRef<'_>) -> bool {
        let Some(key) = left.as_str() else {
            self.problems
                .push(format!("constraint left operand {left} is not a key"));
            return false;
        };
        let functions: Vec<ConstraintFunction> = self
            .engine
            .constraint_functions_for(self.scope, RuleKind::of(rule), key)
            .cloned()
            .collect();
        if functions.is_empty() {
            self.problems.push(format!(
                "no function registered for constraint '{key}' in scope '{}'",
                self.scope
            ));
            return false;
        }
        let mut holds = true;
        for f in &functions {
            holds &= f(operator, right, rule, self.context);
        }
        holds
    }
}
