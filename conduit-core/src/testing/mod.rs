//! Testing utilities and mocks for integration tests
//!
//! Provides mock implementations and test helpers for:
//! - ScriptedDriver: protocol driver with programmable connect outcomes
//! - RecordingPublisher / RecordingSettlement: capture what the pipeline did
//! - EchoMapper: header-driven message mapper
//! - Spec and config builders with short timings

pub mod helpers;
pub mod mock_driver;

pub use helpers::*;
pub use mock_driver::{ConnectBehavior, DriverCall, ScriptedDriver};
