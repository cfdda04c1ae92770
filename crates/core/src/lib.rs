//! Core functionality for the GhostMesh relay stack.
//!
//! This crate provides the ambient pieces shared by the crypto and mesh
//! crates: configuration, structured logging, error types and the clock
//! abstraction used for every freshness window in the relay engine.

pub mod config;
pub mod error;
pub mod logging;
pub mod time;

pub use config::{Config, MeshConfig, SecurityConfig};
pub use error::{CoreError, CoreResult};
pub use time::{current_timestamp_ms, Clock, ManualClock, SystemClock, MS_PER_DAY};
