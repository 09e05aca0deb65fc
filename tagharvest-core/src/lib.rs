//! Core library for tagharvest.
//!
//! Resolves a large list of telemetry tags against a server that limits how
//! many items one subscription may monitor. Tags are admitted in bounded
//! batches, each receives exactly one good value (or is declared
//! unreachable), and the run survives connection loss.
//!
//! The protocol itself sits behind [`session::SubscriptionSession`]; the
//! `simulator` feature provides an in-memory server for tests and demos.

pub mod error;
pub mod harvest;
pub mod input;
pub mod output;
pub mod session;
pub mod types;

pub use error::{HarvestError, Result};
pub use harvest::{HarvestConfig, HarvestProcessor, RunOutcome, RunReport};
