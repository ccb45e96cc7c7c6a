//! Per-service refresh tokens used to authorize webhook deploys.

use rand::RngCore;
use subtle::ConstantTimeEq;

use crate::db::Service;
use crate::DbPool;

use super::error::{DeployError, DeployResult};
use super::store;

const TOKEN_BYTES: usize = 32;

/// Generate a fresh 64-character hex token
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Compare two tokens without leaking where they differ
pub fn tokens_match(presented: &str, stored: &str) -> bool {
    presented.as_bytes().ct_eq(stored.as_bytes()).into()
}

#[derive(Clone)]
pub struct TokenGate {
    db: DbPool,
}

impl TokenGate {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// True only when `token` is the service's current token.
    ///
    /// An unknown service validates as false, the same as a wrong token.
    pub async fn validate(&self, service_id: &str, token: &str) -> DeployResult<bool> {
        let Some(service) = store::get_service(&self.db, service_id).await? else {
            return Ok(false);
        };
        Ok(tokens_match(token, &service.refresh_token))
    }

    pub async fn authorize(&self, service_id: &str, token: &str) -> DeployResult<()> {
        if self.validate(service_id, token).await? {
            Ok(())
        } else {
            Err(DeployError::Unauthorized)
        }
    }

    /// Replace the token; the previous value stops validating immediately
    pub async fn rotate(&self, service_id: &str) -> DeployResult<String> {
        let token = generate_token();
        if !store::write_refresh_token(&self.db, service_id, &token).await? {
            return Err(DeployError::ServiceNotFound(service_id.to_string()));
        }
        tracing::info!(service_id = %service_id, "Refresh token rotated");
        Ok(token)
    }

    /// Resolve the service a webhook URL token belongs to
    pub async fn find_service_by_token(&self, token: &str) -> DeployResult<Service> {
        let candidate = sqlx::query_as::<_, Service>("SELECT * FROM services WHERE refresh_token = ?")
            .bind(token)
            .fetch_optional(&self.db)
            .await?;

        match candidate {
            Some(service) if tokens_match(token, &service.refresh_token) => Ok(service),
            _ => Err(DeployError::Unauthorized),
        }
    }
}
