//! Configuration module for the provisioning run.
//!
//! Configured via a TOML file, with support for environment variable
//! interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [azure]
//! tenant_id = "${AZURE_TENANT_ID}"
//! subscription_id = "${AZURE_SUBSCRIPTION_ID}"
//! location = "westeurope"
//!
//! [resources]
//! resource_group = "rg-opencti-001"
//! managed_identity = "id-opencti-001"
//!
//! [saml]
//! callback_url = "https://opencti.example.com/auth/saml/callback"
//! ```

mod auth;
mod deployment;
mod http;
mod observability;
mod settle;

use std::path::Path;

pub use auth::*;
pub use deployment::*;
pub use http::*;
pub use observability::*;
use serde::{Deserialize, Serialize};
pub use settle::*;

/// Root configuration.
///
/// Only `[azure]`, `[resources]` and `[saml]` need values; every other
/// section has defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "json-schema", derive(schemars::JsonSchema))]
#[serde(deny_unknown_fields)]
pub struct ProvisionConfig {
    /// Target tenant, subscription and endpoints.
    pub azure: AzureConfig,

    /// How the tool authenticates against ARM and Microsoft Graph.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Names of the managed resources.
    pub resources: ResourcesConfig,

    /// SAML application settings.
    pub saml: SamlConfig,

    /// Federation metadata retrieval.
    #[serde(default)]
    pub federation: FederationConfig,

    /// Waits inserted after mutating calls with asynchronous propagation.
    #[serde(default)]
    pub settle: SettleConfig,

    /// Shared HTTP client settings.
    #[serde(default)]
    pub http_client: HttpClientConfig,

    /// Retry behavior for ARM and Graph calls.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Values handed to the deployment templates.
    #[serde(default)]
    pub outputs: OutputsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl ProvisionConfig {
    /// Load configuration from a TOML file.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing required variables will cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;

        Self::from_str(&contents)
    }

    /// Parse configuration from a TOML string.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let mut config: ProvisionConfig = toml::from_str(&expanded).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration for consistency and completeness.
    fn validate(&mut self) -> Result<(), ConfigError> {
        self.azure.validate()?;
        self.auth.validate()?;
        self.resources.validate()?;
        self.saml.validate()?;
        self.federation.validate()?;
        self.settle.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }

    /// ARM scope of the managed resource group.
    pub fn resource_group_scope(&self) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}",
            self.azure.subscription_id, self.resources.resource_group
        )
    }

    /// ARM scope of the subscription.
    pub fn subscription_scope(&self) -> String {
        format!("/subscriptions/{}", self.azure.subscription_id)
    }

    /// Resolve a configured role scope to an ARM scope string.
    pub fn resolve_scope(&self, scope: &RoleScope) -> String {
        match scope {
            RoleScope::ResourceGroup => self.resource_group_scope(),
            RoleScope::Subscription => self.subscription_scope(),
            RoleScope::Custom(id) => id.clone(),
        }
    }

    /// Generate the JSON schema for the configuration file.
    #[cfg(feature = "json-schema")]
    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(ProvisionConfig)
    }

    /// Generate the JSON schema as a pretty-printed JSON string.
    #[cfg(feature = "json-schema")]
    pub fn json_schema_string() -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&Self::json_schema())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, std::path::PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Expand `${VAR}` references, skipping anything after a `#` comment marker.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(format!("invalid interpolation pattern: {e}")))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');

        let mut line_result = String::with_capacity(line.len());
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };

            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            line_result.push_str(&line[last_end..whole.start()]);

            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            line_result.push_str(&value);

            last_end = whole.end();
        }

        line_result.push_str(&line[last_end..]);
        result.push_str(&line_result);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}

/// Require an absolute `https` URL; `http` is accepted for loopback hosts.
pub(crate) fn require_https(field: &str, value: &str) -> Result<url::Url, ConfigError> {
    let url = url::Url::parse(value)
        .map_err(|e| ConfigError::Validation(format!("{field} is not a valid URL: {e}")))?;

    let loopback = matches!(url.host_str(), Some("localhost" | "127.0.0.1" | "[::1]"));
    match url.scheme() {
        "https" => Ok(url),
        "http" if loopback => Ok(url),
        other => Err(ConfigError::Validation(format!(
            "{field} must use https (got '{other}')"
        ))),
    }
}

pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Validation(format!("{field} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const MINIMAL: &str = r#"
        [azure]
        tenant_id = "11111111-1111-1111-1111-111111111111"
        subscription_id = "22222222-2222-2222-2222-222222222222"
        location = "westeurope"

        [resources]
        resource_group = "rg-opencti-001"
        managed_identity = "id-opencti-001"

        [saml]
        callback_url = "https://opencti.example.com/auth/saml/callback"
    "#;

    #[test]
    fn test_minimal_config() {
        let config = ProvisionConfig::from_str(MINIMAL).unwrap();

        assert_eq!(config.resources.resource_group, "rg-opencti-001");
        assert_eq!(config.saml.app_display_name, "OpenCTI");
        assert_eq!(config.resources.groups.infra_admin.display_name, "OpenCTI-InfraAdmin");
        assert!(matches!(config.auth, AuthConfig::AzureCli));
        assert_eq!(config.settle.mode, SettleMode::Fixed);
        assert_eq!(
            config.federation.issuer_url,
            "https://login.microsoftonline.com"
        );
    }

    #[test]
    fn test_scopes() {
        let config = ProvisionConfig::from_str(MINIMAL).unwrap();

        assert_eq!(
            config.resource_group_scope(),
            "/subscriptions/22222222-2222-2222-2222-222222222222/resourceGroups/rg-opencti-001"
        );
        assert_eq!(
            config.resolve_scope(&RoleScope::Subscription),
            "/subscriptions/22222222-2222-2222-2222-222222222222"
        );
        assert_eq!(
            config.resolve_scope(&RoleScope::Custom("/x/y".into())),
            "/x/y"
        );
    }

    #[test]
    fn test_full_config() {
        let config = ProvisionConfig::from_str(
            r#"
            [azure]
            tenant_id = "t"
            subscription_id = "s"
            location = "northeurope"

            [auth]
            type = "client_secret"
            client_id = "c"
            client_secret = "secret"

            [resources]
            resource_group = "rg-opencti-002"
            managed_identity = "id-opencti-002"

            [[resources.role_assignments]]
            role = "AcrPull"
            scope = "subscription"

            [[resources.role_assignments]]
            role = "Key Vault Secrets User"

            [[resources.federated_credentials]]
            name = "fic-opencti-worker"
            issuer = "https://oidc.example.com/issuer"
            subject = "system:serviceaccount:opencti:worker"

            [resources.groups.analysts]
            display_name = "CTI Analysts"
            members = ["33333333-3333-3333-3333-333333333333"]

            [saml]
            app_display_name = "OpenCTI Prod"
            callback_url = "https://cti.example.com/auth/saml/callback"
            notification_email = "secops@example.com"

            [settle]
            mode = "poll"

            [outputs]
            app_version = "6.4.0"
            cluster_name = "aks-opencti"

            [outputs.secrets]
            MINIO_ROOT_PASSWORD = "minio"
        "#,
        )
        .unwrap();

        assert_eq!(config.resources.role_assignments.len(), 2);
        assert_eq!(config.resources.role_assignments[0].scope, RoleScope::Subscription);
        assert_eq!(config.resources.role_assignments[1].scope, RoleScope::ResourceGroup);
        assert_eq!(
            config.resources.federated_credentials[0].audiences,
            vec!["api://AzureADTokenExchange".to_string()]
        );
        assert_eq!(config.resources.groups.analysts.members.len(), 1);
        assert_eq!(config.settle.mode, SettleMode::Poll);
        assert_eq!(config.outputs.secrets.get("MINIO_ROOT_PASSWORD").unwrap(), "minio");
        assert!(matches!(config.auth, AuthConfig::ClientSecret { .. }));
    }

    #[test]
    fn test_missing_tenant_rejected() {
        let err = ProvisionConfig::from_str(&MINIMAL.replace(
            "11111111-1111-1111-1111-111111111111",
            "",
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("tenant_id")));
    }

    #[test]
    fn test_insecure_callback_rejected() {
        let err = ProvisionConfig::from_str(&MINIMAL.replace(
            "https://opencti.example.com",
            "http://opencti.example.com",
        ))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Validation(msg) if msg.contains("https")));
    }

    #[test]
    fn test_loopback_callback_allows_http() {
        let config = ProvisionConfig::from_str(&MINIMAL.replace(
            "https://opencti.example.com",
            "http://localhost:8080",
        ))
        .unwrap();
        assert!(config.saml.callback_url.starts_with("http://localhost"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = ProvisionConfig::from_str(&format!("{MINIMAL}\n[bogus]\nx = 1\n")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cti-provision.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = ProvisionConfig::from_file(&path).unwrap();
        assert_eq!(config.azure.location, "westeurope");
    }

    #[test]
    fn test_from_missing_file() {
        let err = ProvisionConfig::from_file("/nonexistent/cti-provision.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_, _)));
    }

    #[test]
    fn test_env_var_expansion() {
        temp_env::with_var("TEST_TENANT_ID", Some("tenant-from-env"), || {
            let result = expand_env_vars("tenant_id = \"${TEST_TENANT_ID}\"").unwrap();
            assert_eq!(result, "tenant_id = \"tenant-from-env\"");
        });
    }

    #[test]
    fn test_env_var_missing() {
        temp_env::with_var_unset("TEST_UNSET_VAR", || {
            let err = expand_env_vars("x = \"${TEST_UNSET_VAR}\"").unwrap_err();
            assert!(matches!(err, ConfigError::EnvVarNotFound(name) if name == "TEST_UNSET_VAR"));
        });
    }

    #[test]
    fn test_env_var_in_comment_ignored() {
        let result = expand_env_vars("# secret = \"${NONEXISTENT_VAR}\"").unwrap();
        assert_eq!(result, "# secret = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_env_var_after_comment_ignored() {
        let result = expand_env_vars("key = \"value\" # ${NONEXISTENT_VAR}").unwrap();
        assert_eq!(result, "key = \"value\" # ${NONEXISTENT_VAR}");
    }

    #[test]
    fn test_trailing_newline_preserved() {
        assert_eq!(expand_env_vars("a = 1\n").unwrap(), "a = 1\n");
        assert_eq!(expand_env_vars("a = 1").unwrap(), "a = 1");
    }
}
