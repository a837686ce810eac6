//! # Playlist Sync Library
//!
//! Keeps playlists on different streaming platforms in step: platform
//! adapters, the track matcher, the sync orchestrator and the dispatcher
//! that schedules it.

pub mod config;
pub mod crypto;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod matcher;
pub mod models;
pub mod orchestrator;
pub mod platforms;
pub mod repositories;
pub mod telemetry;
pub mod token_refresh;
pub use migration;
