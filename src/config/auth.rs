use serde::{Deserialize, Serialize};

use super::{ConfigError, require_non_empty};

/// Credential used for ARM and Microsoft Graph calls.
#[derive(Clone, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum AuthConfig {
    /// Reuse the session established by `az login`.
    #[default]
    AzureCli,

    /// Service principal with a client secret.
    ClientSecret {
        /// Tenant of the service principal. Defaults to `azure.tenant_id`.
        #[serde(default)]
        tenant_id: Option<String>,
        /// Client ID.
        client_id: String,
        /// Client secret.
        client_secret: String,
    },

    /// Managed identity of the host running the tool.
    ManagedIdentity {
        /// Client ID of a user-assigned identity (omit for system-assigned).
        #[serde(default)]
        client_id: Option<String>,
    },

    /// Pre-acquired bearer tokens, one per audience.
    Static {
        /// Token for `https://management.azure.com`.
        arm_token: String,
        /// Token for `https://graph.microsoft.com`.
        graph_token: String,
    },
}

impl AuthConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        match self {
            AuthConfig::AzureCli | AuthConfig::ManagedIdentity { .. } => Ok(()),
            AuthConfig::ClientSecret {
                client_id,
                client_secret,
                ..
            } => {
                require_non_empty("auth.client_id", client_id)?;
                require_non_empty("auth.client_secret", client_secret)
            }
            AuthConfig::Static {
                arm_token,
                graph_token,
            } => {
                require_non_empty("auth.arm_token", arm_token)?;
                require_non_empty("auth.graph_token", graph_token)
            }
        }
    }

    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthConfig::AzureCli => "azure_cli",
            AuthConfig::ClientSecret { .. } => "client_secret",
            AuthConfig::ManagedIdentity { .. } => "managed_identity",
            AuthConfig::Static { .. } => "static",
        }
    }
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthConfig::AzureCli => f.debug_struct("AzureCli").finish(),
            AuthConfig::ClientSecret {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ClientSecret")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"****")
                .finish(),
            AuthConfig::ManagedIdentity { client_id } => f
                .debug_struct("ManagedIdentity")
                .field("client_id", client_id)
                .finish(),
            AuthConfig::Static { .. } => f
                .debug_struct("Static")
                .field("arm_token", &"****")
                .field("graph_token", &"****")
                .finish(),
        }
    }
}
