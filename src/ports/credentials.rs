use crate::domain::{AuthenticatorId, Credentials, Result};
use async_trait::async_trait;

/// Port for managing proxy authentication credentials
#[async_trait]
pub trait CredentialsPort: Send + Sync {
    /// Identity of this credentials source; part of every connection key
    fn identity(&self) -> AuthenticatorId;

    /// Get credentials for a specific proxy host
    ///
    /// Returns None if no credentials are configured for this host
    async fn get_credentials(&self, host: &str) -> Result<Option<Credentials>>;

    /// Clear credentials cache (if any)
    async fn clear_cache(&self) -> Result<()>;
}
