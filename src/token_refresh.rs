//! # Token Refresh
//!
//! On-demand refresh of connection credentials. Refreshes are single-flight
//! per connection inside the process, and the connection row is locked for
//! the duration of the provider call so concurrent workers serialize on the
//! database as well. A caller that waited behind another refresh reuses the
//! token it produced instead of calling the provider again.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use metrics::{counter, histogram};
use sea_orm::TransactionTrait;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::TokenRefreshConfig;
use crate::error::SyncError;
use crate::models::connection::{ConnectionStatus, Model as ConnectionModel};
use crate::platforms::{AccessContext, PlatformError, PlatformRegistry};
use crate::repositories::ConnectionRepository;

#[derive(Clone)]
pub struct TokenRefresher {
    connections: ConnectionRepository,
    registry: PlatformRegistry,
    lead_time: Duration,
    in_flight: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl TokenRefresher {
    pub fn new(
        connections: ConnectionRepository,
        registry: PlatformRegistry,
        config: &TokenRefreshConfig,
    ) -> Self {
        Self {
            connections,
            registry,
            lead_time: Duration::seconds(config.lead_time_seconds as i64),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Decrypted credentials for `connection`, refreshed first when the
    /// access token expires within the lead time and a refresh token exists.
    pub async fn access_for(&self, connection: &ConnectionModel) -> Result<AccessContext, SyncError> {
        let ctx = self.connections.access_context(connection)?;
        let expiring = connection
            .expires_at
            .is_some_and(|at| at.with_timezone(&Utc) <= Utc::now() + self.lead_time);
        if !expiring {
            return Ok(ctx);
        }

        let has_refresh = connection.refresh_token_ciphertext.is_some();
        if !has_refresh {
            return Ok(ctx);
        }

        match self.refresh(connection.id, &ctx.access_token).await {
            Ok(fresh) => Ok(fresh),
            // The old token may still be accepted; let the call decide
            Err(SyncError::Platform(err)) if err.is_retryable() => {
                warn!(connection_id = %connection.id, error = %err, "Proactive refresh failed; using current token");
                Ok(ctx)
            }
            Err(err) => Err(err),
        }
    }

    /// Replaces `stale_access_token` with a fresh one.
    ///
    /// A provider rejection of the refresh token marks the connection
    /// expired.
    #[instrument(skip_all, fields(connection_id = %connection_id))]
    pub async fn refresh(
        &self,
        connection_id: Uuid,
        stale_access_token: &str,
    ) -> Result<AccessContext, SyncError> {
        let gate = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.entry(connection_id).or_default().clone()
        };

        let result = {
            let _guard = gate.lock().await;
            self.refresh_locked(connection_id, stale_access_token, Utc::now())
                .await
        };

        {
            let mut in_flight = self.in_flight.lock().await;
            // one reference in the map, one held here
            if Arc::strong_count(&gate) <= 2 {
                in_flight.remove(&connection_id);
            }
        }

        result
    }

    async fn refresh_locked(
        &self,
        connection_id: Uuid,
        stale_access_token: &str,
        now: DateTime<Utc>,
    ) -> Result<AccessContext, SyncError> {
        let txn = self.connections.db.begin().await?;
        let connection = self
            .connections
            .find_for_update(&txn, connection_id)
            .await?
            .ok_or(SyncError::ConnectionNotFound(connection_id))?;
        let provider = connection.provider()?;

        if connection.connection_status()? == ConnectionStatus::Expired {
            txn.rollback().await?;
            return Err(SyncError::ConnectionExpired { connection_id });
        }

        let tokens = self.connections.open_tokens(&connection)?;
        let still_valid = connection
            .expires_at
            .is_none_or(|at| at.with_timezone(&Utc) > now + self.lead_time);
        if tokens
            .access_token
            .as_deref()
            .is_some_and(|current| current != stale_access_token)
            && still_valid
        {
            txn.commit().await?;
            record_outcome(provider.as_str(), "reused");
            info!(connection_id = %connection_id, "Reusing token refreshed by a concurrent caller");
            return self.connections.access_context(&connection);
        }

        let Some(refresh_token) = tokens.refresh_token else {
            txn.rollback().await?;
            record_outcome(provider.as_str(), "unavailable");
            return Err(PlatformError::Auth {
                provider,
                message: "no refresh token stored".to_string(),
            }
            .into());
        };

        let adapter = self.registry.get(provider)?;
        let started = std::time::Instant::now();
        let grant = match adapter.refresh_access_token(&refresh_token).await {
            Ok(grant) => grant,
            Err(err) => {
                txn.rollback().await?;
                record_outcome(provider.as_str(), "failure");
                error!(
                    connection_id = %connection_id,
                    provider = %provider,
                    error = %err,
                    "Token refresh failed"
                );
                if err.is_auth() {
                    self.connections.mark_expired(connection_id).await?;
                }
                return Err(err.into());
            }
        };
        histogram!("token_refresh_latency_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        let updated = self
            .connections
            .store_refreshed_tokens(&txn, connection, &grant, now)
            .await?;
        txn.commit().await?;

        record_outcome(provider.as_str(), "success");
        info!(
            connection_id = %connection_id,
            provider = %provider,
            expires_at = ?updated.expires_at,
            "Refreshed connection tokens"
        );
        self.connections.access_context(&updated)
    }
}

fn record_outcome(provider: &str, outcome: &'static str) {
    let metric_labels = vec![
        ("provider", provider.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!("token_refresh_total", &metric_labels).increment(1);
}
