//! Bearer tokens for Azure Resource Manager and Microsoft Graph.
//!
//! Tokens are cached per audience as pre-formatted `Bearer ...` header
//! values and refreshed shortly before they expire.

use std::{collections::HashMap, sync::Arc};

use azure_core::credentials::{AccessToken, Secret, TokenCredential};
use azure_identity::{
    AzureCliCredential, ClientSecretCredential, ManagedIdentityCredential,
    ManagedIdentityCredentialOptions, UserAssignedId,
};
use tokio::sync::RwLock;

use crate::{config::AuthConfig, provider::ProviderError};

/// Buffer time before token expiry to trigger refresh (5 minutes).
const TOKEN_REFRESH_BUFFER_SECS: u64 = 300;

/// API a token is issued for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Audience {
    Management,
    Graph,
}

impl Audience {
    pub fn scope(&self) -> &'static str {
        match self {
            Audience::Management => "https://management.azure.com/.default",
            Audience::Graph => "https://graph.microsoft.com/.default",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Audience::Management => "arm",
            Audience::Graph => "graph",
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    /// Pre-formatted header value: "Bearer {token}"
    bearer_header: Arc<str>,
    expires_at: std::time::Instant,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        std::time::Instant::now() >= self.expires_at
    }
}

enum Source {
    Credential(Arc<dyn TokenCredential>),
    Static { arm: Arc<str>, graph: Arc<str> },
}

/// Token source backed by an `azure_identity` credential or fixed tokens.
pub struct AzureTokenSource {
    source: Source,
    auth_type: &'static str,
    cached: RwLock<HashMap<Audience, CachedToken>>,
}

impl std::fmt::Debug for AzureTokenSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureTokenSource")
            .field("type", &self.auth_type)
            .finish()
    }
}

impl AzureTokenSource {
    fn from_credential(credential: Arc<dyn TokenCredential>, auth_type: &'static str) -> Self {
        Self {
            source: Source::Credential(credential),
            auth_type,
            cached: RwLock::new(HashMap::new()),
        }
    }

    /// Reuse the Azure CLI session.
    pub fn from_azure_cli() -> Result<Self, ProviderError> {
        let credential = AzureCliCredential::new(None).map_err(|e| {
            ProviderError::Auth(format!("Failed to create Azure CLI credential: {e}"))
        })?;
        Ok(Self::from_credential(credential, "AzureCli"))
    }

    /// Service principal with client secret.
    pub fn from_client_secret(
        tenant_id: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Self, ProviderError> {
        let credential = ClientSecretCredential::new(
            tenant_id,
            client_id.to_string(),
            Secret::new(client_secret.to_string()),
            None,
        )
        .map_err(|e| {
            ProviderError::Auth(format!("Failed to create client secret credential: {e}"))
        })?;
        Ok(Self::from_credential(credential, "ClientSecret"))
    }

    /// Managed identity of the host. Pass the client id of a user-assigned
    /// identity, or `None` for the system-assigned one.
    pub fn from_managed_identity(client_id: Option<&str>) -> Result<Self, ProviderError> {
        let options = client_id.map(|id| {
            tracing::info!(client_id = id, "Using user-assigned managed identity");
            ManagedIdentityCredentialOptions {
                user_assigned_id: Some(UserAssignedId::ClientId(id.to_string())),
                ..Default::default()
            }
        });

        let credential = ManagedIdentityCredential::new(options).map_err(|e| {
            ProviderError::Auth(format!("Failed to create managed identity credential: {e}"))
        })?;
        Ok(Self::from_credential(credential, "ManagedIdentity"))
    }

    /// Fixed tokens, one per audience.
    pub fn from_static(arm_token: &str, graph_token: &str) -> Self {
        Self {
            source: Source::Static {
                arm: format!("Bearer {arm_token}").into(),
                graph: format!("Bearer {graph_token}").into(),
            },
            auth_type: "Static",
            cached: RwLock::new(HashMap::new()),
        }
    }

    /// Build the token source described by `[auth]`.
    pub fn from_config(auth: &AuthConfig, tenant_id: &str) -> Result<Self, ProviderError> {
        match auth {
            AuthConfig::AzureCli => Self::from_azure_cli(),
            AuthConfig::ClientSecret {
                tenant_id: sp_tenant,
                client_id,
                client_secret,
            } => Self::from_client_secret(
                sp_tenant.as_deref().unwrap_or(tenant_id),
                client_id,
                client_secret,
            ),
            AuthConfig::ManagedIdentity { client_id } => {
                Self::from_managed_identity(client_id.as_deref())
            }
            AuthConfig::Static {
                arm_token,
                graph_token,
            } => Ok(Self::from_static(arm_token, graph_token)),
        }
    }

    pub fn auth_type(&self) -> &'static str {
        self.auth_type
    }

    /// A valid `Bearer ...` header value for `audience`.
    pub async fn bearer_header(&self, audience: Audience) -> Result<Arc<str>, ProviderError> {
        let credential = match &self.source {
            Source::Static { arm, graph } => {
                return Ok(match audience {
                    Audience::Management => arm.clone(),
                    Audience::Graph => graph.clone(),
                });
            }
            Source::Credential(credential) => credential,
        };

        {
            let cache = self.cached.read().await;
            if let Some(cached) = cache.get(&audience)
                && !cached.is_expired()
            {
                return Ok(cached.bearer_header.clone());
            }
        }

        let mut cache = self.cached.write().await;

        // Another task may have refreshed while we waited for the lock.
        if let Some(cached) = cache.get(&audience)
            && !cached.is_expired()
        {
            return Ok(cached.bearer_header.clone());
        }

        let access_token: AccessToken = credential
            .get_token(&[audience.scope()], None)
            .await
            .map_err(|e| {
                ProviderError::Auth(format!(
                    "Failed to get {} token via {}: {e}",
                    audience.label(),
                    self.auth_type
                ))
            })?;

        let now = time::OffsetDateTime::now_utc();
        let expires_in_secs = (access_token.expires_on - now).whole_seconds().max(0) as u64;
        let expires_at = std::time::Instant::now()
            + std::time::Duration::from_secs(expires_in_secs.saturating_sub(TOKEN_REFRESH_BUFFER_SECS));

        let bearer_header: Arc<str> = format!("Bearer {}", access_token.token.secret()).into();

        cache.insert(
            audience,
            CachedToken {
                bearer_header: bearer_header.clone(),
                expires_at,
            },
        );

        tracing::debug!(
            audience = audience.label(),
            auth_type = self.auth_type,
            expires_in_secs,
            "Acquired Azure token"
        );

        Ok(bearer_header)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_token_expiry() {
        let token = CachedToken {
            bearer_header: "Bearer test".into(),
            expires_at: std::time::Instant::now() + std::time::Duration::from_secs(3600),
        };
        assert!(!token.is_expired());

        let expired_token = CachedToken {
            bearer_header: "Bearer test".into(),
            expires_at: std::time::Instant::now() - std::time::Duration::from_secs(1),
        };
        assert!(expired_token.is_expired());
    }

    #[tokio::test]
    async fn test_static_tokens_per_audience() {
        let source = AzureTokenSource::from_static("arm-token", "graph-token");

        assert_eq!(
            &*source.bearer_header(Audience::Management).await.unwrap(),
            "Bearer arm-token"
        );
        assert_eq!(
            &*source.bearer_header(Audience::Graph).await.unwrap(),
            "Bearer graph-token"
        );
        assert_eq!(source.auth_type(), "Static");
    }

    #[test]
    fn test_from_config_static() {
        let auth = AuthConfig::Static {
            arm_token: "a".into(),
            graph_token: "g".into(),
        };
        let source = AzureTokenSource::from_config(&auth, "tenant").unwrap();
        assert_eq!(format!("{source:?}"), "AzureTokenSource { type: \"Static\" }");
    }

    #[test]
    fn test_scopes() {
        assert_eq!(Audience::Management.scope(), "https://management.azure.com/.default");
        assert_eq!(Audience::Graph.scope(), "https://graph.microsoft.com/.default");
    }
}
