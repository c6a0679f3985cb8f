//! Step definitions for Cucumber scenarios

pub mod request_steps;
pub mod result_steps;
