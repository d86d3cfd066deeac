//! # duet-common
//!
//! Shared configuration, error types, and credential handling used across all Duet crates.
//! This is the foundation layer: no call logic, just primitives and contracts.

pub mod config;
pub mod credentials;
pub mod error;

pub use credentials::Credentials;
pub use error::{CredentialError, CredentialResult};
