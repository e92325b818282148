//! Validation orchestrator.
//!
//! Wires the preparation and execution services to the Postgres-backed queue and job ledger,
//! runs validators through Apptainer, and provides the operator subcommands.

pub mod apptainer;
pub mod config;
pub mod migrate;
pub mod serve;
pub mod submit;
