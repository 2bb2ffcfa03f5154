//! Ermes Common - Shared types and utilities
//!
//! This crate provides the session and resource types, the keyspace
//! layout, error definitions and configuration used across all Ermes
//! components.

pub mod config;
pub mod error;
pub mod keyspace;
pub mod options;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use keyspace::{KeySpace, KeySpaceError, KeySpaces};
pub use options::*;
pub use types::*;
