pub mod audit;
pub mod auth;
pub mod dos_guard;
pub mod legacy;
pub mod metrics;
