//! MLINZI - Position & Trade Reconciliation Engine
//!
//! Keeps three views of "what positions exist" consistent for a leveraged
//! trading agent: the local trade ledger, the exchange's live position
//! list, and a remote mirror database.

pub mod api;
pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
pub mod sync;
pub mod task_runner;
