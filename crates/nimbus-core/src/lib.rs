pub mod cache;
pub mod compress;
pub mod config;
pub mod control;
pub mod crypto;
pub mod pipeline;
pub mod snapshot;
pub mod store;

#[cfg(test)]
mod testutil;

pub use nimbus_types::{BlockKey, FileId, NimbusError, ObjectId, Result};
