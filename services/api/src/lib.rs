//! Avatar API Library Crate
//!
//! HTTP surface over the avatar session orchestrator: configuration, shared
//! state, the PostgreSQL response store, handlers and routing. The `api`
//! binary is a thin wrapper around this library.

pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
