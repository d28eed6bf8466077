//! Azure backend.
//!
//! Resource groups, managed identities, federated credentials and role
//! assignments go through Azure Resource Manager; security groups,
//! applications and service principals go through Microsoft Graph.

mod arm;
mod graph;
mod rest;
mod retry;
mod token;

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rest::RestClient;
pub use token::{Audience, AzureTokenSource};

use crate::{
    config::ProvisionConfig,
    provider::{
        ApplicationApi, GroupMembershipEdge, ProviderError, ProviderResult, ResourceApi,
        ResourceRef, SessionInfo,
    },
    reconcile::{DesiredAttributes, ResourceSpec},
};

/// API endpoints. Overridden in tests to point at a mock server.
#[derive(Debug, Clone)]
pub struct BaseUrls {
    pub management: String,
    pub graph: String,
}

impl Default for BaseUrls {
    fn default() -> Self {
        Self {
            management: "https://management.azure.com".into(),
            graph: "https://graph.microsoft.com".into(),
        }
    }
}

/// [`ResourceApi`] and [`ApplicationApi`] over ARM and Microsoft Graph.
pub struct AzureCloud {
    rest: RestClient,
    base: BaseUrls,
    subscription_id: String,
    /// `(scope, role name)` → role definition id.
    role_definitions: DashMap<(String, String), String>,
}

impl AzureCloud {
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<AzureTokenSource>,
        retry: crate::config::RetryConfig,
        subscription_id: impl Into<String>,
        base: BaseUrls,
    ) -> Self {
        Self {
            rest: RestClient::new(http, tokens, retry),
            base,
            subscription_id: subscription_id.into(),
            role_definitions: DashMap::new(),
        }
    }

    /// Build from configuration, creating the credential described by `[auth]`.
    pub fn from_config(config: &ProvisionConfig, http: reqwest::Client) -> ProviderResult<Self> {
        let tokens = AzureTokenSource::from_config(&config.auth, &config.azure.tenant_id)?;
        tracing::info!(auth = tokens.auth_type(), "Using Azure credential");
        Ok(Self::new(
            http,
            Arc::new(tokens),
            config.retry.clone(),
            config.azure.subscription_id.clone(),
            BaseUrls {
                management: config.azure.management_url.clone(),
                graph: config.azure.graph_url.clone(),
            },
        ))
    }
}

#[async_trait]
impl ResourceApi for AzureCloud {
    async fn check_session(&self) -> ProviderResult<SessionInfo> {
        self.subscription_session().await
    }

    async fn probe(&self, spec: &ResourceSpec) -> ProviderResult<Option<ResourceRef>> {
        match &spec.desired {
            DesiredAttributes::ResourceGroup { .. } => {
                self.probe_resource_group(&spec.natural_key).await
            }
            DesiredAttributes::ManagedIdentity { resource_group, .. } => {
                self.probe_managed_identity(resource_group, &spec.natural_key)
                    .await
            }
            DesiredAttributes::FederatedCredential {
                resource_group,
                identity_name,
                ..
            } => {
                self.probe_federated_credential(resource_group, identity_name, &spec.natural_key)
                    .await
            }
            DesiredAttributes::RoleAssignment {
                principal_id,
                scope,
                role_name,
                ..
            } => {
                self.probe_role_assignment(principal_id, scope, role_name)
                    .await
            }
            DesiredAttributes::SecurityGroup { .. } => {
                self.probe_security_group(&spec.natural_key).await
            }
            DesiredAttributes::Application { .. } => Ok(self
                .find_application(&spec.natural_key)
                .await?
                .map(|app| ResourceRef::new(app.object_id).with_client_id(app.app_id))),
            DesiredAttributes::ServicePrincipal { app_id } => Ok(self
                .find_service_principal(app_id)
                .await?
                .map(service_principal_ref)),
        }
    }

    async fn create(&self, spec: &ResourceSpec) -> ProviderResult<ResourceRef> {
        match &spec.desired {
            DesiredAttributes::ResourceGroup { location, tags } => {
                self.create_resource_group(&spec.natural_key, location, tags)
                    .await
            }
            DesiredAttributes::ManagedIdentity {
                resource_group,
                location,
                tags,
            } => {
                self.create_managed_identity(resource_group, &spec.natural_key, location, tags)
                    .await
            }
            DesiredAttributes::FederatedCredential {
                resource_group,
                identity_name,
                issuer,
                subject,
                audiences,
            } => {
                self.create_federated_credential(
                    resource_group,
                    identity_name,
                    &spec.natural_key,
                    issuer,
                    subject,
                    audiences,
                )
                .await
            }
            DesiredAttributes::RoleAssignment {
                principal_id,
                principal_type,
                scope,
                role_name,
            } => {
                let Some(role_definition_id) = self.role_definition(scope, role_name).await? else {
                    return Err(ProviderError::NotFound(format!(
                        "role definition '{role_name}' at {scope}"
                    )));
                };
                self.create_role_assignment(principal_id, *principal_type, scope, &role_definition_id)
                    .await
            }
            DesiredAttributes::SecurityGroup {
                mail_nickname,
                description,
            } => {
                self.create_security_group(&spec.natural_key, mail_nickname, description.as_deref())
                    .await
            }
            DesiredAttributes::Application { sign_in_audience } => {
                self.create_application(&spec.natural_key, sign_in_audience)
                    .await
            }
            DesiredAttributes::ServicePrincipal { app_id } => Ok(service_principal_ref(
                self.create_service_principal(app_id).await?,
            )),
        }
    }

    async fn find_role_definition(
        &self,
        scope: &str,
        role_name: &str,
    ) -> ProviderResult<Option<String>> {
        self.role_definition(scope, role_name).await
    }

    async fn principal_visible(&self, principal_id: &str) -> ProviderResult<bool> {
        self.directory_object_exists(principal_id).await
    }

    async fn add_group_member(&self, edge: &GroupMembershipEdge) -> ProviderResult<()> {
        self.add_member(edge).await
    }
}

fn service_principal_ref(sp: crate::provider::ServicePrincipal) -> ResourceRef {
    ResourceRef::new(sp.id.clone())
        .with_principal_id(sp.id)
        .with_client_id(sp.app_id)
}
