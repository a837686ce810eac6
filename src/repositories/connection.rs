//! Connection repository
//!
//! Stores provider grants with their tokens sealed by the [`TokenVault`].

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use sea_orm::sea_query::{Expr, LockType};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, QueryFilter,
    QuerySelect, Set,
};
use uuid::Uuid;

use crate::crypto::{TokenPair, TokenVault, is_encrypted_payload};
use crate::error::{SyncError, is_unique_violation};
use crate::models::connection::{
    self, ActiveModel, ConnectionStatus, Entity as Connection, Model, Provider,
};
use crate::platforms::{AccessContext, TokenGrant};

/// Input for [`ConnectionRepository::create`].
#[derive(Clone)]
pub struct NewConnection {
    pub user_id: Uuid,
    pub provider: Provider,
    pub provider_user_id: Option<String>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub can_read: bool,
    pub can_write: bool,
    pub can_export: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    pub db: Arc<DatabaseConnection>,
    vault: TokenVault,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>, vault: TokenVault) -> Self {
        Self { db, vault }
    }

    /// Inserts a connection with sealed tokens. A second non-expired
    /// connection for the same user and provider is rejected.
    pub async fn create(&self, input: NewConnection) -> Result<Model, SyncError> {
        let id = Uuid::new_v4();
        let now = Utc::now().fixed_offset();
        let provider = input.provider.as_str();

        let access = self
            .vault
            .seal(id, provider, input.user_id, &input.access_token)?;
        let refresh = input
            .refresh_token
            .as_deref()
            .map(|token| self.vault.seal(id, provider, input.user_id, token))
            .transpose()?;

        let model = ActiveModel {
            id: Set(id),
            user_id: Set(input.user_id),
            provider: Set(provider.to_string()),
            provider_user_id: Set(input.provider_user_id),
            status: Set(ConnectionStatus::Connected.as_str().to_string()),
            access_token_ciphertext: Set(Some(access)),
            refresh_token_ciphertext: Set(refresh),
            expires_at: Set(input.expires_at.map(|t| t.fixed_offset())),
            scope: Set(input.scope),
            can_read: Set(input.can_read),
            can_write: Set(input.can_write),
            can_export: Set(input.can_export),
            last_used_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        };

        match Connection::insert(model).exec_without_returning(&*self.db).await {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(SyncError::DuplicateConnection {
                    user_id: input.user_id,
                    provider: input.provider,
                });
            }
            Err(err) => return Err(err.into()),
        }

        self.require(id).await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Model>, SyncError> {
        Ok(Connection::find_by_id(id).one(&*self.db).await?)
    }

    pub async fn require(&self, id: Uuid) -> Result<Model, SyncError> {
        self.get(id).await?.ok_or(SyncError::ConnectionNotFound(id))
    }

    /// Loads the row with `SELECT ... FOR UPDATE` inside the caller's
    /// transaction. SQLite ignores the lock clause.
    pub async fn find_for_update<C>(&self, conn: &C, id: Uuid) -> Result<Option<Model>, SyncError>
    where
        C: ConnectionTrait,
    {
        Ok(Connection::find_by_id(id)
            .lock(LockType::Update)
            .one(conn)
            .await?)
    }

    pub fn open_tokens(&self, connection: &Model) -> Result<TokenPair, SyncError> {
        let legacy = [
            &connection.access_token_ciphertext,
            &connection.refresh_token_ciphertext,
        ]
        .into_iter()
        .flatten()
        .any(|token| !is_encrypted_payload(token));
        if legacy {
            tracing::warn!(
                connection_id = %connection.id,
                provider = %connection.provider,
                "Legacy plaintext tokens detected, consider migrating to encrypted format"
            );
        }

        self.vault.open_tokens(connection).map_err(|e| {
            tracing::error!(
                connection_id = %connection.id,
                provider = %connection.provider,
                "Token decryption failed"
            );
            e.into()
        })
    }

    /// Decrypts the access token into a per-call context. A connection
    /// without one cannot be used.
    pub fn access_context(&self, connection: &Model) -> Result<AccessContext, SyncError> {
        let tokens = self.open_tokens(connection)?;
        let access_token = tokens
            .access_token
            .ok_or(SyncError::ConnectionExpired {
                connection_id: connection.id,
            })?;
        Ok(AccessContext {
            connection_id: connection.id,
            access_token,
            provider_user_id: connection.provider_user_id.clone(),
        })
    }

    /// Persists a refreshed grant. The refresh token is only replaced when
    /// the provider rotated it.
    pub async fn store_refreshed_tokens<C>(
        &self,
        conn: &C,
        connection: Model,
        grant: &TokenGrant,
        now: DateTime<Utc>,
    ) -> Result<Model, SyncError>
    where
        C: ConnectionTrait,
    {
        let provider = connection.provider.clone();
        let access = self
            .vault
            .seal(connection.id, &provider, connection.user_id, &grant.access_token)?;
        let refresh = grant
            .refresh_token
            .as_deref()
            .map(|token| {
                self.vault
                    .seal(connection.id, &provider, connection.user_id, token)
            })
            .transpose()?;

        let mut active: ActiveModel = connection.into();
        active.access_token_ciphertext = Set(Some(access));
        if let Some(refresh) = refresh {
            active.refresh_token_ciphertext = Set(Some(refresh));
        }
        active.expires_at = Set(grant
            .expires_in
            .map(|secs| (now + Duration::seconds(secs as i64)).fixed_offset()));
        if let Some(scope) = &grant.scope {
            active.scope = Set(Some(scope.clone()));
        }
        active.status = Set(ConnectionStatus::Connected.as_str().to_string());
        active.updated_at = Set(now.fixed_offset());

        Ok(active.update(conn).await?)
    }

    pub async fn mark_expired(&self, id: Uuid) -> Result<(), SyncError> {
        tracing::warn!(connection_id = %id, "Marking connection expired");
        Connection::update_many()
            .col_expr(
                connection::Column::Status,
                Expr::value(ConnectionStatus::Expired.as_str()),
            )
            .col_expr(
                connection::Column::UpdatedAt,
                Expr::value(Utc::now().fixed_offset()),
            )
            .filter(connection::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn touch_last_used(&self, id: Uuid, now: DateTime<Utc>) -> Result<(), SyncError> {
        Connection::update_many()
            .col_expr(
                connection::Column::LastUsedAt,
                Expr::value(Some(now.fixed_offset())),
            )
            .filter(connection::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        Ok(())
    }

    /// Seals tokens still stored as plaintext. Returns the number of
    /// connections rewritten.
    pub async fn reencrypt_legacy_tokens(&self) -> Result<usize, SyncError> {
        let connections = Connection::find().all(&*self.db).await?;
        let mut updated = 0usize;

        for conn in connections {
            let access = self.seal_legacy(&conn, conn.access_token_ciphertext.as_deref())?;
            let refresh = self.seal_legacy(&conn, conn.refresh_token_ciphertext.as_deref())?;
            if access.is_none() && refresh.is_none() {
                continue;
            }

            let connection_id = conn.id;
            let mut active: ActiveModel = conn.into();
            if let Some(cipher) = access {
                active.access_token_ciphertext = Set(Some(cipher));
            }
            if let Some(cipher) = refresh {
                active.refresh_token_ciphertext = Set(Some(cipher));
            }
            active.updated_at = Set(Utc::now().fixed_offset());
            active.update(&*self.db).await?;
            tracing::info!(connection_id = %connection_id, "Re-encrypted legacy tokens");
            updated += 1;
        }

        Ok(updated)
    }

    fn seal_legacy(&self, conn: &Model, stored: Option<&[u8]>) -> Result<Option<Vec<u8>>, SyncError> {
        let Some(plain) = stored.filter(|s| !s.is_empty() && !is_encrypted_payload(s)) else {
            return Ok(None);
        };
        let token = String::from_utf8_lossy(plain);
        Ok(Some(self.vault.seal(conn.id, &conn.provider, conn.user_id, &token)?))
    }
}
