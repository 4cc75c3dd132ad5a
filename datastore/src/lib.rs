//! rslive datastore: the back-end service owning the encrypted relational
//! store.
//!
//! The library surface exists so the repositories and migrator are usable
//! from integration tests and operational tooling; the `rslive-datastore`
//! binary wires them to the IPC socket.

pub mod db;
pub mod migrations;
pub mod models;
pub mod repo;
pub mod schema;
pub mod server;
pub mod service;
pub mod summarize;
