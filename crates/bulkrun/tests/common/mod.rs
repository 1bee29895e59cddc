//! Shared test utilities for bulkrun integration tests.
//!
//! This module provides:
//! - `TestHarness` with a temp directory, a file-backed store and an
//!   in-process queue
//! - Scripted executor and notifier doubles plus input builders

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
