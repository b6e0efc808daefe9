//! Durable storage for planforge: the generation-request ledger and the
//! duration-metrics store, both backed by PostgreSQL.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
