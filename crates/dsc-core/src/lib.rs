//! # dsc-core: Foundational Types for the Connector
//!
//! Every other crate in the workspace depends on `dsc-core`; it depends on
//! nothing internal.
//!
//! ## Contents
//!
//! - **Identity** (`identity.rs`): `WorkerId` for lease holders and
//!   `generate_id()` for entity identifiers.
//!
//! - **Temporal** (`temporal.rs`): the `Clock` abstraction. All entity
//!   timestamps are UTC epoch milliseconds obtained through a `Clock`, so
//!   retry and lease arithmetic can be driven deterministically in tests.
//!
//! - **Status results** (`status.rs`): `StatusResult<T>`, the outcome type of
//!   provisioners and data-flow controllers, distinguishing fatal failures
//!   from retryable ones.
//!
//! - **Query** (`query.rs`): `QuerySpec` (filter, sort, paging) and an
//!   in-memory resolver used by the reference stores.
//!
//! - **Errors** (`error.rs`): the shared error hierarchy.
//!
//! ## Crate Policy
//!
//! - No dependencies on other `dsc-*` crates.
//! - No `unsafe` code.
//! - No `panic!()` or `.unwrap()` outside tests.

pub mod error;
pub mod identity;
pub mod query;
pub mod status;
pub mod temporal;

pub use error::{ConnectorError, StateError};
pub use identity::{generate_id, WorkerId};
pub use query::{Criterion, QueryError, QueryResolver, QuerySpec, SortOrder};
pub use status::{ResponseStatus, StatusFailure, StatusResult};
pub use temporal::{Clock, ManualClock, SystemClock};
