//! Sparcus Core Library
//!
//! This library provides the telemetry sink behind `sparcusd`:
//! - A bounded, windowed store of readings keyed by hierarchical path
//! - Executable handlers triggered by matching writes, with an event log
//! - Forwarding of every write to Graphite and MQTT
//! - Persistence of store and event log across restarts
//! - The HTTP surface, configuration, and logging setup
//!
//! The binary entry point is in `main.rs`.

pub mod config;
pub mod daemon;
pub mod dispatch;
pub mod events;
pub mod exit_codes;
pub mod forward;
pub mod handlers;
pub mod logging;
pub mod persist;
pub mod server;
pub mod signals;
pub mod store;
