//! Runnable front-ends for conduit connections
//!
//! - `common`: CLI arguments, configuration loading, logging setup
//! - `simulated`: a randomized in-process driver and mapper for local runs

pub mod common;
pub mod simulated;
