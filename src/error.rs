//! Error taxonomy for orchestration and persistence.

use sea_orm::DbErr;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::CryptoError;
use crate::models::ParseEnumError;
use crate::models::connection::Provider;
use crate::platforms::{PlatformError, RegistryError};

/// Failures that stop a sync from starting or finishing.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Another pending or running job holds the playlist lock
    #[error("a sync job is already active for playlist {playlist_id}")]
    AlreadyRunning { playlist_id: Uuid },

    #[error("playlist {0} not found")]
    PlaylistNotFound(Uuid),

    #[error("connection {0} not found")]
    ConnectionNotFound(Uuid),

    #[error("sync job {0} not found")]
    JobNotFound(Uuid),

    #[error("connection {connection_id} is expired")]
    ConnectionExpired { connection_id: Uuid },

    #[error("user {user_id} already has an active {provider} connection")]
    DuplicateConnection { user_id: Uuid, provider: Provider },

    #[error("invalid playlist configuration: {0}")]
    InvalidPlaylist(String),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("database error: {0}")]
    Database(#[from] DbErr),

    #[error("token vault error: {0}")]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("invalid stored value: {0}")]
    InvalidData(#[from] ParseEnumError),

    #[error("failed to encode job logs: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Returns true when `error` is a unique-constraint violation on Postgres
/// or SQLite.
pub fn is_unique_violation(error: &DbErr) -> bool {
    use sea_orm::RuntimeErr;

    const PG_UNIQUE: &str = "23505";
    const SQLITE_DUPLICATE_CODES: &[&str] = &["1555", "2067"];

    let runtime_err = match error {
        DbErr::Query(RuntimeErr::SqlxError(sqlx_err))
        | DbErr::Exec(RuntimeErr::SqlxError(sqlx_err)) => sqlx_err,
        DbErr::RecordNotInserted => return false,
        other => return other.to_string().contains("UNIQUE constraint failed"),
    };

    let Some(db_error) = runtime_err.as_database_error() else {
        return false;
    };

    if db_error.is_unique_violation() {
        return true;
    }

    if let Some(code) = db_error.code() {
        let code_str = code.as_ref();
        if code_str == PG_UNIQUE || SQLITE_DUPLICATE_CODES.contains(&code_str) {
            return true;
        }
    }

    db_error.message().contains("UNIQUE constraint failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_sqlx_errors_are_not_unique_violations() {
        assert!(!is_unique_violation(&DbErr::RecordNotFound("x".into())));
        assert!(!is_unique_violation(&DbErr::RecordNotInserted));
    }

    #[test]
    fn platform_errors_convert_transparently() {
        let err: SyncError = PlatformError::WriteNotSupported {
            provider: Provider::AppleMusic,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "apple_music does not support writing playlists"
        );
    }
}
