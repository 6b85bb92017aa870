//! `SQLite` storage for the `DocVerify` daemon.
//!
//! Persists session records, final analysis results, and the message buffer
//! used by the database-backed progress broker.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::*;
