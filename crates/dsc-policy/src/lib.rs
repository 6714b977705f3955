//! # dsc-policy: Usage Policy Evaluation
//!
//! Evaluates usage policies (permissions, prohibitions, duties, each with
//! constraints) against the claims of a requesting participant, within a
//! named *scope* such as `contract.negotiation` or `transfer.process`.
//!
//! ## Architecture
//!
//! - **Model** (`model.rs`): the immutable policy tree.
//! - **Agent and context** (`context.rs`): the requesting participant's
//!   claims, and the per-evaluation context that collects problems and
//!   carries typed data between functions.
//! - **Bindings** (`binding.rs`): which action types and constraint keys
//!   are relevant in which scopes.
//! - **Scope filter** (`scope.rs`): strips rules and constraints that are
//!   not bound to the evaluated scope before any function runs.
//! - **Engine** (`engine.rs`): explicit registry of rule functions,
//!   constraint functions, and pre/post validators keyed by scope.
//! - **Archive** (`archive.rs`): lookup of the policy governing a contract.
//!
//! ## Scopes
//!
//! Scopes are dot-delimited. A binding or function registered for `a`
//! applies when evaluating `a` and `a.b`, but not `ab`. The scope
//! [`ALL_SCOPES`] (`*`) matches everything.

pub mod archive;
pub mod binding;
pub mod context;
pub mod engine;
pub mod model;
pub mod scope;

pub use archive::PolicyArchive;
pub use binding::{scope_applies, RuleBindingRegistry, ALL_SCOPES};
pub use context::{ParticipantAgent, PolicyContext};
pub use engine::{PolicyEngine, PolicyError, RuleKind};
pub use model::{Action, Constraint, Duty, Operator, Permission, Policy, Prohibition, RuleRef};
pub use scope::ScopeFilter;
