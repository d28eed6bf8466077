//! Values handed to the deployment templates.
//!
//! Secrets and variables are flat name → value maps. Values the run could
//! not determine are left out and listed in [`DeploymentOutputs::missing`]
//! so the operator can supply them by hand.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::{
    config::{OutputFormat, ProvisionConfig},
    federation::CertificatePayload,
};

/// Identifiers gathered during a run.
#[derive(Debug, Clone, Default)]
pub struct RunFacts {
    /// Client id of the managed identity.
    pub identity_client_id: Option<String>,
    /// Object id of the infrastructure-admin group.
    pub admin_group_id: Option<String>,
    /// Client id of the SAML application.
    pub saml_client_id: Option<String>,
    pub certificate: Option<CertificatePayload>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeploymentOutputs {
    pub secrets: BTreeMap<String, String>,
    pub variables: BTreeMap<String, String>,
    /// Names that could not be filled.
    #[serde(skip)]
    pub missing: Vec<String>,
}

impl DeploymentOutputs {
    pub fn assemble(config: &ProvisionConfig, facts: &RunFacts) -> Self {
        let mut outputs = Self::default();

        outputs.secret("AZURE_CLIENT_ID", facts.identity_client_id.clone());
        outputs.secret("AZURE_TENANT_ID", Some(config.azure.tenant_id.clone()));
        outputs.secret(
            "AZURE_SUBSCRIPTION_ID",
            Some(config.azure.subscription_id.clone()),
        );
        outputs.secret(
            "SAML_CERT",
            facts.certificate.as_ref().map(|c| c.base64_single.clone()),
        );
        for (name, value) in &config.outputs.secrets {
            outputs.secrets.insert(name.clone(), value.clone());
        }

        let o = &config.outputs;
        outputs.variable("APP_NAME", Some(o.app_name.clone()));
        outputs.variable("APP_VERSION", o.app_version.clone());
        outputs.variable("GROUP_OBJECT_ID", facts.admin_group_id.clone());
        outputs.variable("SAML_CALLBACK_URL", Some(config.saml.callback_url.clone()));
        outputs.variable(
            "SAML_ENTRY_POINT",
            Some(saml_entry_point(&config.federation.issuer_url, &config.azure.tenant_id)),
        );
        outputs.variable(
            "SAML_ISSUER",
            facts.saml_client_id.as_deref().map(|id| format!("api://{id}")),
        );
        outputs.variable("CLUSTER_NAME", o.cluster_name.clone());
        outputs.variable("REGISTRY_NAME", o.registry_name.clone());

        outputs
    }

    fn secret(&mut self, name: &str, value: Option<String>) {
        match value {
            Some(value) => {
                self.secrets.insert(name.to_string(), value);
            }
            None => self.missing.push(name.to_string()),
        }
    }

    fn variable(&mut self, name: &str, value: Option<String>) {
        match value {
            Some(value) => {
                self.variables.insert(name.to_string(), value);
            }
            None => self.missing.push(name.to_string()),
        }
    }

    pub fn render(&self, format: OutputFormat) -> Result<String, serde_json::Error> {
        match format {
            OutputFormat::Env => Ok(self.render_env()),
            OutputFormat::Json => {
                let mut json = serde_json::to_string_pretty(self)?;
                json.push('\n');
                Ok(json)
            }
        }
    }

    /// dotenv text: secrets first, then variables, each sorted by name.
    fn render_env(&self) -> String {
        let mut out = String::from("# Secrets\n");
        for (name, value) in &self.secrets {
            out.push_str(&format!("{name}={}\n", env_value(value)));
        }
        out.push_str("\n# Variables\n");
        for (name, value) in &self.variables {
            out.push_str(&format!("{name}={}\n", env_value(value)));
        }
        out
    }
}

/// SAML 2.0 sign-in endpoint of the tenant.
pub fn saml_entry_point(issuer_url: &str, tenant_id: &str) -> String {
    format!("{}/{tenant_id}/saml2", issuer_url.trim_end_matches('/'))
}

/// Quote a dotenv value when it holds anything but plain characters.
fn env_value(value: &str) -> String {
    let plain = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:@+=,".contains(c));
    if plain && !value.is_empty() {
        return value.to_string();
    }
    let escaped = value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r")
        .replace('$', "\\$")
        .replace('`', "\\`");
    format!("\"{escaped}\"")
}
