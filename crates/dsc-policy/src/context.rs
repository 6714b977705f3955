//! # Participant Agent and Policy Context

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The participant on whose behalf a policy is evaluated.
///
/// `claims` come from verified credentials of the counterparty; `attributes`
/// are locally assigned facts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParticipantAgent {
    /// Verified claims.
    pub claims: BTreeMap<String, Value>,
    /// Local attributes.
    pub attributes: BTreeMap<String, String>,
}

impl ParticipantAgent {
    /// An agent with no claims and no attributes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a claim.
    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.claims.insert(key.into(), value.into());
        self
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Look up a claim.
    pub fn claim(&self, key: &str) -> Option<&Value> {
        self.claims.get(key)
    }
}

/// State of a single evaluation: the agent, the problems reported so far,
/// and typed data shared between functions.
pub struct PolicyContext {
    agent: ParticipantAgent,
    problems: Vec<String>,
    data: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl PolicyContext {
    /// A fresh context for `agent`.
    pub fn new(agent: ParticipantAgent) -> Self {
        Self {
            agent,
            problems: Vec::new(),
            data: HashMap::new(),
        }
    }

    /// The participant under evaluation.
    pub fn agent(&self) -> &ParticipantAgent {
        &self.agent
    }

    /// Record a diagnostic. A context with problems fails evaluation.
    pub fn report_problem(&mut self, problem: impl Into<String>) {
        self.problems.push(problem.into());
    }

    /// Whether any problem has been reported.
    pub fn has_problems(&self) -> bool {
        !self.problems.is_empty()
    }

    /// The problems reported so far.
    pub fn problems(&self) -> &[String] {
        &self.problems
    }

    pub(crate) fn take_problems(&mut self) -> Vec<String> {
        std::mem::take(&mut self.problems)
    }

    /// Store a value keyed by its type, replacing any previous one.
    pub fn put_data<T: Any + Send + Sync>(&mut self, value: T) {
        self.data.insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Fetch a value by type.
    pub fn data<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.data
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }
}

impl std::fmt::Debug for PolicyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyContext")
            .field("agent", &self.agent)
            .field("problems", &self.problems)
            .field("data_entries", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct ContractStart(i64);

    #[test]
    fn typed_data_round_trip() {
        let mut ctx = PolicyContext::new(ParticipantAgent::new());
        assert!(ctx.data::<ContractStart>().is_none());
        ctx.put_data(ContractStart(17));
        assert_eq!(ctx.data::<ContractStart>(), Some(&ContractStart(17)));
    }

    #[test]
    fn problems_accumulate() {
        let mut ctx = PolicyContext::new(ParticipantAgent::new().with_claim("region", "eu"));
        assert!(!ctx.has_problems());
        ctx.report_problem("first");
        ctx.report_problem("second");
        assert_eq!(ctx.problems(), ["first", "second"]);
        assert_eq!(ctx.take_problems().len(), 2);
        assert!(!ctx.has_problems());
        assert_eq!(ctx.agent().claim("region"), Some(&Value::from("eu")));
    }
}
