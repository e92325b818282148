//! Lite-mode implementations of `validation-core` interfaces.
//!
//! This module provides a Postgres-backed queue and job ledger for single-database deployments,
//! plus in-process equivalents used by tests and local runs.

pub mod memory;
pub mod pgledger;
pub mod pgqueue;
