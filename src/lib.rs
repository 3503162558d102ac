//! keygate: API key issuance and validation core for an LLM gateway.
//!
//! Secrets are stored only as versioned one-way hashes. Validation resolves a
//! presented secret through the hash index, falls back to legacy hash formats
//! and finally to a bounded, DoS-guarded full scan. Legacy matches are
//! re-hashed in the background under a distributed lease.

pub mod clock;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod errors;
pub mod jobs;
pub mod lock;
pub mod middleware;
pub mod models;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod usage;
pub mod validator;

pub use errors::{AuthError, AuthFailure};
pub use service::{ApiKeyService, ServiceDeps};
