//! Integration tests for fleet-certs
//!
//! These tests drive the services against a mock CA (wiremock), temp-dir
//! certificate stores and a fake reverse proxy.

mod end_to_end_tests;
mod health_tests;
mod install_tests;
mod negotiation_tests;
mod probe_tests;
mod renewal_tests;
mod verify_tests;
