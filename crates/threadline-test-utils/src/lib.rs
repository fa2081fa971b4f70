#![deny(unsafe_code)]

//! Shared test utilities for the Threadline workspace.
//!
//! Provides scripted providers, fault-injecting stores, config builders, and
//! tracing helpers so that individual crate tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! threadline-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod provider;
pub mod store;
pub mod tracing_setup;

pub use config::TestConfigBuilder;
pub use provider::ScriptedProvider;
pub use store::{FaultyStore, StoreOp};
pub use tracing_setup::{capture_logs, init_test_tracing};
