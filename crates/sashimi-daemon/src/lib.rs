//! HTTP facade for the sashimi search service.

pub mod auth;
pub mod server;
pub mod telemetry;
