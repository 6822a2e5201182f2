//! Co-op Authority Server Library
//!
//! Authoritative server core for a small co-op extraction game: AI
//! simulation, item transfer locks, dirty/delta state sync and a priority
//! outbound queue, all driven by one fixed-rate tick loop.
//!
//! # Features
//!
//! - `anticheat` - Rule-based movement, damage and reach validation (enabled by default)

pub mod anticheat;
pub mod catalog;
pub mod config;
pub mod game;
pub mod metrics;
pub mod net;
pub mod persistence;
pub mod sync;
pub mod util;
