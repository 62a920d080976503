//! Shared test utilities for lake integration tests.
//!
//! This crate provides:
//! - Scripted fakes for every source collaborator, with failure injection
//!   and call counters
//! - Fixture builders for nodes, vote accounts, distributions and samples
//! - Assertion helpers over dataset rows
//!
//! # Example
//!
//! ```rust,ignore
//! use lake_test_utils::{FakeSolanaRpc, node};
//!
//! let rpc = FakeSolanaRpc::new(600);
//! rpc.set_nodes(vec![node("A", "10.0.0.1")]);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]
#![allow(clippy::must_use_candidate)]
// Test utilities use expect/unwrap for cleaner test code - panics are acceptable in tests
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::panic)]

pub mod assertions;
pub mod fakes;
pub mod fixtures;

pub use assertions::*;
pub use fakes::*;
pub use fixtures::*;

/// Initialize test logging (call once per test module).
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("lake=debug".parse().expect("valid directive")),
        )
        .with_test_writer()
        .try_init();
}
