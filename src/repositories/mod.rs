//! # Repository Layer
//!
//! Repositories encapsulate SeaORM operations for each table. They are built
//! explicitly around a shared connection pool and injected where needed.

pub mod connection;
pub mod playlist;
pub mod sync_job;
pub mod sync_log;

pub use connection::{ConnectionRepository, NewConnection};
pub use playlist::{NewPlaylist, PlaylistRepository};
pub use sync_job::{JobCompletion, JobCounts, SyncJobRepository};
pub use sync_log::{NewSyncLog, SyncLogRepository};
