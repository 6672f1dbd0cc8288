// Module naming: common pattern in domain-driven code
#![allow(clippy::module_name_repetitions)]
// Function complexity: protocol dispatch is inherently branchy
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
// Numeric casts: intentional in protocol code
#![allow(clippy::cast_possible_truncation)]

//! beacon - MQTT 3.1/3.1.1/5.0 broker.
//!
//! # Module Organization
//!
//! ## Core
//! - `core::config` - Configuration parsing and validation
//! - `core::time` - Deterministic time utilities
//!
//! ## Protocol
//! - `protocol::primitives` - Integers, strings, variable-byte integers
//! - `protocol::packet` - Version-aware control packet codec
//! - `protocol::properties` - MQTT 5 property blocks
//! - `protocol::codes` - Reason codes and per-version mapping
//!
//! ## Routing
//! - `topic` - Topic validation and wildcard matching
//! - `store` - Session, subscription, retained and auth capabilities
//!
//! ## Broker
//! - `broker` - Assembly, registry, shutdown
//! - `broker::connection` - Per-connection actor
//! - `broker::delivery` - Publish routing and retained replay
//! - `broker::sweeper` - Session/message expiry sweeping
//! - `broker::listener` - TCP accept loop
//!
//! ## Operations
//! - `telemetry` - Logging initialization
//! - `cli` - Command-line entry points

pub mod broker;
pub mod cli;
pub mod core;
pub mod error;
pub mod protocol;
pub mod store;
pub mod telemetry;
pub mod topic;

// Re-exports for convenience
pub use self::core::{config, time};
pub use broker::Broker;
pub use error::{AuthError, CodecError, StoreError};
