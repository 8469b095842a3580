#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # divvy
//!
//! A network-accessible rate-limit decision service. A client describes an
//! operation as a bag of key-value labels; divvy answers whether it is
//! permitted right now, with the remaining credit and the time until the
//! bucket refills.
//!
//! Limits are declared in an INI file as an ordered list of rules. Each rule
//! matches a family of operations through exact and prefix patterns, assigns
//! a credit budget and window, and may name an actor label that partitions
//! the budget (per IP, per user, and so on):
//!
//! ```ini
//! [default]
//! creditLimit = 10
//! resetSeconds = 60
//!
//! [method=GET path=/ping* ip=*]
//! creditLimit = 100
//! resetSeconds = 60
//! actorField = ip
//! ```
//!
//! Clients speak a one-line-per-request ASCII protocol over TCP:
//!
//! ```text
//! > HIT method=GET path=/ping ip=1.2.3.4
//! < OK true 99 60
//! ```
//!
//! ## Architecture
//!
//! - **Rules**: [`rules::RuleTable`] resolves an operation to its governing
//!   rule, first match wins; unreachable rules are rejected at load time.
//! - **Wire**: [`wire`] lexes request lines and formats replies.
//! - **Server**: [`server::Server`] frames by newline and handles each
//!   connection on its own task, strictly in order within a connection.
//! - **Handler**: [`handler::HitHandler`] projects the operation onto the
//!   matched rule, derives a stable bucket key, and consumes credit.
//! - **Backend**: [`backend::Backend`] is the atomic counter seam;
//!   [`backend::MemoryBackend`] for a single instance,
//!   [`backend::redis::RedisBackend`] for a shared deployment.
//! - **Metrics**: [`metrics::MetricsSink`] receives counters, gauges, and
//!   timers describing every decision.

pub mod backend;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod operation;
pub mod rules;
pub mod server;
pub mod wire;

// Re-exports
pub use backend::{Backend, HitOutcome, MemoryBackend};
pub use error::{BoxError, ConfigError, ProtocolError};
pub use handler::{FailurePolicy, HitHandler};
pub use metrics::{LogSink, MemorySink, MetricEvent, MetricsSink, NullSink};
pub use operation::Operation;
pub use rules::{Pattern, Rule, RuleTable};
pub use server::Server;
pub use wire::{Reply, Request};
