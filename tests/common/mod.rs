//! Common test utilities and helpers
//!
//! This module provides shared test infrastructure including:
//! - A throwaway certificate authority and temp-dir configurations
//! - A mock CA server that signs what it receives
//! - Fake reverse proxy, operator and renewer implementations

#![allow(dead_code)]

pub mod fixtures;

pub use fixtures::*;
pub use mocks::*;
