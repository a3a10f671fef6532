//! Persistence layer — libSQL-backed user and job stores.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{JobBatch, JobStatus, ScheduledJob, Stage, Store, UserRecord};
