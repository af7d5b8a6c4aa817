//! SAM task execution orchestrator.
//!
//! This crate primarily ships an `orchestrator` binary, but we expose the
//! library surface so integration tests can drive the actors directly.

pub mod actors;
pub mod api;
pub mod callback;
pub mod clients;
pub mod config;
pub mod db;
pub mod error;
pub mod observability;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod state;
