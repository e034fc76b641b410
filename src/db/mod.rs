//! Database module: Postgres access for the orcha schemas.
//!
//! Layout:
//! - `models.rs`: Rust structs mirroring DB rows
//! - `schema.rs`: DDL and the expected column definitions
//! - `postgres.rs`: pool setup, readiness polling and task/run storage
//! - `service_status.rs`: service heartbeats

pub mod models;
pub mod postgres;
pub mod schema;
pub mod service_status;

pub use models::{LogRecord, RunRecord, ServiceStatusRecord, TaskRecord};
pub use postgres::{OrchaStorage, RunFilter, connect, ping, wait_for_database};
