//! Deployment-scenario sections: target account, managed resources, SAML
//! application, federation metadata and emitted outputs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{ConfigError, require_https, require_non_empty};

/// Non-gallery application template used for custom SAML applications.
pub const NON_GALLERY_TEMPLATE_ID: &str = "8adf8e6e-67b2-4cf2-a259-e3dc5476c621";

/// Audience expected on tokens exchanged through a federated credential.
pub const FEDERATED_TOKEN_AUDIENCE: &str = "api://AzureADTokenExchange";

/// Target tenant, subscription and API endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct AzureConfig {
    /// Directory (tenant) ID.
    pub tenant_id: String,

    /// Subscription holding the resource group.
    pub subscription_id: String,

    /// Region for the resource group and managed identity.
    pub location: String,

    /// Azure Resource Manager endpoint.
    #[serde(default = "default_management_url")]
    pub management_url: String,

    /// Microsoft Graph endpoint.
    #[serde(default = "default_graph_url")]
    pub graph_url: String,
}

impl AzureConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("azure.tenant_id", &self.tenant_id)?;
        require_non_empty("azure.subscription_id", &self.subscription_id)?;
        require_non_empty("azure.location", &self.location)?;
        require_https("azure.management_url", &self.management_url)?;
        require_https("azure.graph_url", &self.graph_url)?;
        Ok(())
    }
}

fn default_management_url() -> String {
    "https://management.azure.com".to_string()
}

fn default_graph_url() -> String {
    "https://graph.microsoft.com".to_string()
}

/// Names of the resources the run manages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct ResourcesConfig {
    /// Resource group name (e.g. `rg-opencti-001`).
    pub resource_group: String,

    /// User-assigned managed identity name.
    pub managed_identity: String,

    /// Tags applied to the resource group and managed identity on creation.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,

    /// The three security groups mapped to application roles.
    #[serde(default)]
    pub groups: GroupsConfig,

    /// Roles granted to the managed identity.
    #[serde(default = "default_role_assignments")]
    pub role_assignments: Vec<RoleAssignmentConfig>,

    /// Workload identity bindings on the managed identity.
    #[serde(default)]
    pub federated_credentials: Vec<FederatedCredentialConfig>,
}

impl ResourcesConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("resources.resource_group", &self.resource_group)?;
        require_non_empty("resources.managed_identity", &self.managed_identity)?;
        for (slot, group) in self.groups.iter() {
            require_non_empty(&format!("resources.groups.{slot}.display_name"), &group.display_name)?;
        }
        for assignment in &self.role_assignments {
            require_non_empty("resources.role_assignments.role", &assignment.role)?;
            if let RoleScope::Custom(id) = &assignment.scope
                && !id.starts_with('/')
            {
                return Err(ConfigError::Validation(format!(
                    "custom role scope must be an ARM resource id, got '{id}'"
                )));
            }
        }
        for credential in &self.federated_credentials {
            require_non_empty("resources.federated_credentials.name", &credential.name)?;
            require_non_empty("resources.federated_credentials.subject", &credential.subject)?;
            require_https("resources.federated_credentials.issuer", &credential.issuer)?;
            if credential.audiences.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "federated credential '{}' needs at least one audience",
                    credential.name
                )));
            }
        }
        Ok(())
    }
}

/// Managed security groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct GroupsConfig {
    #[serde(default = "default_infra_admin_group")]
    pub infra_admin: GroupConfig,

    #[serde(default = "default_threat_intel_group")]
    pub threat_intel: GroupConfig,

    #[serde(default = "default_analysts_group")]
    pub analysts: GroupConfig,
}

impl Default for GroupsConfig {
    fn default() -> Self {
        Self {
            infra_admin: default_infra_admin_group(),
            threat_intel: default_threat_intel_group(),
            analysts: default_analysts_group(),
        }
    }
}

impl GroupsConfig {
    /// Groups in a fixed order, labelled by slot.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &GroupConfig)> {
        [
            ("infra_admin", &self.infra_admin),
            ("threat_intel", &self.threat_intel),
            ("analysts", &self.analysts),
        ]
        .into_iter()
    }
}

/// One security group.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct GroupConfig {
    /// Display name; also the natural key.
    pub display_name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Object IDs of users to add as members.
    #[serde(default)]
    pub members: Vec<String>,
}

impl GroupConfig {
    fn named(display_name: &str, description: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            description: Some(description.to_string()),
            members: Vec::new(),
        }
    }
}

fn default_infra_admin_group() -> GroupConfig {
    GroupConfig::named("OpenCTI-InfraAdmin", "OpenCTI platform administrators")
}

fn default_threat_intel_group() -> GroupConfig {
    GroupConfig::named("OpenCTI-ThreatIntel", "OpenCTI threat intelligence team")
}

fn default_analysts_group() -> GroupConfig {
    GroupConfig::named("OpenCTI-Analysts", "OpenCTI analysts")
}

/// A role granted to the managed identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct RoleAssignmentConfig {
    /// Built-in or custom role name (e.g. `Contributor`).
    pub role: String,

    #[serde(default)]
    pub scope: RoleScope,
}

/// Where a role is granted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(rename_all = "snake_case")]
pub enum RoleScope {
    /// The managed resource group.
    #[default]
    ResourceGroup,
    /// The whole subscription.
    Subscription,
    /// An explicit ARM resource id.
    Custom(String),
}

fn default_role_assignments() -> Vec<RoleAssignmentConfig> {
    vec![RoleAssignmentConfig {
        role: "Contributor".to_string(),
        scope: RoleScope::ResourceGroup,
    }]
}

/// A federated identity credential on the managed identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct FederatedCredentialConfig {
    pub name: String,

    /// OIDC issuer of the external workload (e.g. the cluster's issuer URL).
    pub issuer: String,

    /// Subject claim (e.g. `system:serviceaccount:opencti:opencti`).
    pub subject: String,

    #[serde(default = "default_audiences")]
    pub audiences: Vec<String>,
}

fn default_audiences() -> Vec<String> {
    vec![FEDERATED_TOKEN_AUDIENCE.to_string()]
}

/// SAML application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct SamlConfig {
    /// Display name of the application and service principal.
    #[serde(default = "default_app_display_name")]
    pub app_display_name: String,

    /// Assertion consumer URL, also used as the logout URL.
    pub callback_url: String,

    /// Address notified before the signing certificate expires.
    #[serde(default)]
    pub notification_email: Option<String>,

    /// External sign-in URL shown in the My Apps portal.
    #[serde(default)]
    pub login_url: Option<String>,

    /// Application template to instantiate.
    #[serde(default = "default_template_id")]
    pub template_id: String,

    /// Display name of generated token-signing certificates.
    #[serde(default = "default_certificate_display_name")]
    pub certificate_display_name: String,

    /// Lifetime of generated token-signing certificates.
    #[serde(default = "default_certificate_validity_days")]
    pub certificate_validity_days: u32,
}

impl SamlConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        require_non_empty("saml.app_display_name", &self.app_display_name)?;
        require_https("saml.callback_url", &self.callback_url)?;
        if let Some(login_url) = &self.login_url {
            require_https("saml.login_url", login_url)?;
        }
        if let Some(email) = &self.notification_email
            && !email.contains('@')
        {
            return Err(ConfigError::Validation(format!(
                "saml.notification_email is not an email address: '{email}'"
            )));
        }
        if self.certificate_validity_days == 0 {
            return Err(ConfigError::Validation(
                "saml.certificate_validity_days must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn default_app_display_name() -> String {
    "OpenCTI".to_string()
}

fn default_template_id() -> String {
    NON_GALLERY_TEMPLATE_ID.to_string()
}

fn default_certificate_display_name() -> String {
    "CN=OpenCTI SAML Signing".to_string()
}

fn default_certificate_validity_days() -> u32 {
    1095
}

/// Federation metadata retrieval.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct FederationConfig {
    /// Login host serving the metadata document.
    #[serde(default = "default_issuer_url")]
    pub issuer_url: String,

    /// Timeout of the primary fetch.
    #[serde(default = "default_federation_timeout")]
    pub timeout_secs: u64,

    /// Timeout of the fallback fetch.
    #[serde(default = "default_fallback_timeout")]
    pub fallback_timeout_secs: u64,

    /// User-Agent sent with the primary fetch.
    #[serde(default = "default_federation_user_agent")]
    pub user_agent: String,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            issuer_url: default_issuer_url(),
            timeout_secs: default_federation_timeout(),
            fallback_timeout_secs: default_fallback_timeout(),
            user_agent: default_federation_user_agent(),
        }
    }
}

impl FederationConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        require_https("federation.issuer_url", &self.issuer_url)?;
        if self.timeout_secs == 0 || self.fallback_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "federation timeouts must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn default_issuer_url() -> String {
    "https://login.microsoftonline.com".to_string()
}

fn default_federation_timeout() -> u64 {
    30
}

fn default_fallback_timeout() -> u64 {
    60
}

fn default_federation_user_agent() -> String {
    format!("cti-provision/{} (federation-metadata)", env!("CARGO_PKG_VERSION"))
}

/// Values forwarded verbatim to the deployment templates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct OutputsConfig {
    #[serde(default = "default_app_name")]
    pub app_name: String,

    #[serde(default)]
    pub app_version: Option<String>,

    #[serde(default)]
    pub cluster_name: Option<String>,

    #[serde(default)]
    pub registry_name: Option<String>,

    /// Deployment-supplied credentials (object storage, message broker, ...).
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,

    /// Default rendering when `--format` is not given.
    #[serde(default)]
    pub format: OutputFormat,
}

impl Default for OutputsConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            app_version: None,
            cluster_name: None,
            registry_name: None,
            secrets: BTreeMap::new(),
            format: OutputFormat::default(),
        }
    }
}

fn default_app_name() -> String {
    "opencti".to_string()
}

/// Rendering of the emitted outputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// `KEY=value` lines.
    #[default]
    Env,
    /// A JSON object with `secrets` and `variables`.
    Json,
}
