//! Shared wire protocol for the rslive gateway and datastore services.
//!
//! This crate is the single source of truth for everything both processes
//! must agree on: the message schema, the pipe-delimited framing codec, the
//! error taxonomy carried in response frames, and the environment-backed
//! configuration both binaries load at startup.

pub mod config;
pub mod error;
pub mod frame;
pub mod schema;

pub use config::{DatastoreConfig, GatewayConfig};
pub use error::ErrorKind;
pub use frame::{RequestFrame, ResponseFrame};
pub use schema::{FieldKind, FieldSpec, Lane, MessageType};
