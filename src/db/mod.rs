//! Database module for PostgreSQL and SQLite connections

pub mod connection;

pub use connection::{connect_postgres, connect_sqlite};
