//! Gateway: command surface over the session registry.
//!
//! Requests arrive as JSON-line frames, are routed by method name through
//! `methods.rs` and answered in the order they complete. Each request runs
//! on its own task, so a long pairing wait never blocks other callers.

pub mod methods;
pub mod server;
pub mod state;
