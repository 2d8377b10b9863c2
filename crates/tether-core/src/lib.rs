// Core tether functionality: transcript model, aggregation and the session store

pub mod backend;
pub mod config;
pub mod domain;
pub mod error;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use config::{PersistenceConfig, RuntimeConfig};
pub use error::{Error, Result};
