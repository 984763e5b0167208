//! Clearance DB Library
//!
//! Postgres repositories for uploads and the durable job queue.

pub mod db;

pub use db::{run_migrations, setup_database, JobRepository, UploadRepository, MIGRATOR};
