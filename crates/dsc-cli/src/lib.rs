//! # dsc-cli: Data-Space Connector Command-Line Interface
//!
//! Configuration loading and the in-process demo behind the `dsc`
//! binary. Argument parsing lives in `main.rs`; the handlers there only
//! resolve configuration and call into this crate.
//!
//! ## Subcommands
//!
//! - `check-config`: print the resolved configuration.
//! - `demo`: negotiate and transfer a number of assets between an
//!   in-process consumer and provider.

pub mod config;
pub mod demo;

pub use config::{ConfigError, ConnectorConfig, ManagerConfig};
pub use demo::{DemoConnector, DemoError, DemoSummary, TransferSummary};
