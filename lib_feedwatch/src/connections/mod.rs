//! # Connections Module
//!
//! Driver-backed implementations of the `FeedConnector` seam.

/// MongoDB change streams via the official driver.
pub mod db_mongo;

pub use db_mongo::{MongoConnector, DEFAULT_SERVER_SELECTION_TIMEOUT};
