//! HTTP and WebSocket surface over the fetchcast job orchestrator.

pub mod api;
pub mod metrics;
pub mod state;
