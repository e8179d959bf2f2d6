//! Shipwright API models
//!
//! Request and response bodies for the orchestrator HTTP surface.

pub mod models;
