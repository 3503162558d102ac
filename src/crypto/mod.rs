pub mod hash;
pub mod secret;

pub use hash::{HashEngine, HashVersion};
