//! # Data Models
//!
//! SeaORM entities for connections, playlists, sync jobs and sync logs, plus
//! the string-backed enums stored in their columns.

use thiserror::Error;

pub mod connection;
pub mod playlist;
pub mod sync_job;
pub mod sync_log;

pub use connection::Entity as Connection;
pub use playlist::Entity as Playlist;
pub use sync_job::Entity as SyncJob;
pub use sync_log::Entity as SyncLog;

/// A stored column held a value outside its enum.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
