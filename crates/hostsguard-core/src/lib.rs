//! Core types for the hosts-file integrity guard: configuration, the
//! protected-file model, the policy classifier, unlock-session state, and
//! the append-only tamper log.

pub mod config;
pub mod errors;
pub mod event_log;
pub mod paths;
pub mod policy;
pub mod protected_file;
pub mod schema;
pub mod session;

pub use errors::{GuardError, Result};
