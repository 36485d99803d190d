//! Common test infrastructure
//!
//! This module provides the infrastructure needed for end-to-end tests.
//! Tests should only import from this module, not from internal submodules.

mod client;
mod server;

// Public API - this is what tests import
pub use client::{decode_content, TestClient};
pub use server::TestServer;
