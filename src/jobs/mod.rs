pub mod collision;
pub mod expiry;
pub mod migration;
