//! Cache and iterative resolution engine for the recursive DNS
//! resolver. Builds on the wire codec in the `dns-types` crate.

pub mod cache;
pub mod context;
pub mod metrics;
pub mod recursive;
pub mod util;

pub use recursive::resolve;
