//! Testing utilities and mock implementations
//!
//! Lets the session be exercised end to end without a running broker.

pub mod mocks;

pub use mocks::*;
