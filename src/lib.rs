//! changeprop - change propagation library
//!
//! This library consumes change events from Kafka, matches them against
//! declarative rules and issues the derived HTTP requests, with retries,
//! deduplication, rate limiting and safe offset commits.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `rule`: Rule compiler (matchers, request templates, retry policy, sampler)
//! - `engine`: Consume-dispatch-commit loop, offset tracking, rule and retry processors
//! - `subscription`: Topic discovery and per-rule engine supervision
//! - `kafka`: Broker contracts, rdkafka adapters and an in-memory broker
//! - `dedup` / `ratelimit`: Collaborators consulted before execution
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use changeprop::cli::Cli;
//! use changeprop::Config;
//! use clap::Parser;
//!
//! fn main() -> anyhow::Result<()> {
//!     let cli = Cli::parse_from(["changeprop", "check"]);
//!     let config = Config::load("config.yaml", &cli)?;
//!     config.validate()?;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod error;
pub mod event;
pub mod kafka;
pub mod logging;
pub mod metrics;
pub mod ratelimit;
pub mod rule;
pub mod subscription;

// Re-export commonly used types
pub use config::Config;
pub use error::{ChangepropError, Result};
pub use event::Event;
pub use rule::Rule;
pub use subscription::SubscriptionManager;
