//! Microsoft Graph calls: security groups, membership, applications and
//! service principals.

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use reqwest::Method;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};

use super::{
    AzureCloud,
    rest::{Idempotency, build_url, odata_literal},
    token::Audience,
};
use crate::provider::{
    AppRole, AppRoleAssignmentEdge, Application, ApplicationApi, ApplicationPatch,
    GroupMembershipEdge, ProviderError, ProviderResult, ResourceRef, ServicePrincipal,
    ServicePrincipalPatch,
};

const GRAPH_VERSION: &str = "/v1.0";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphObject {
    id: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphWeb {
    #[serde(default)]
    redirect_uris: Vec<String>,
    #[serde(default)]
    logout_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAppRole {
    id: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default = "enabled")]
    is_enabled: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphApplication {
    id: String,
    app_id: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    identifier_uris: Vec<String>,
    #[serde(default)]
    web: Option<GraphWeb>,
    #[serde(default)]
    group_membership_claims: Option<String>,
    #[serde(default)]
    app_roles: Vec<GraphAppRole>,
}

impl From<GraphApplication> for Application {
    fn from(app: GraphApplication) -> Self {
        let web = app.web.unwrap_or_default();
        Application {
            object_id: app.id,
            app_id: app.app_id,
            display_name: app.display_name,
            identifier_uris: app.identifier_uris,
            redirect_uris: web.redirect_uris,
            logout_url: web.logout_url,
            group_membership_claims: app.group_membership_claims,
            app_roles: app
                .app_roles
                .into_iter()
                .map(|role| AppRole {
                    id: role.id,
                    value: role.value,
                    display_name: role.display_name,
                    is_enabled: role.is_enabled,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphServicePrincipal {
    id: String,
    app_id: String,
    #[serde(default)]
    preferred_single_sign_on_mode: Option<String>,
    #[serde(default)]
    notification_email_addresses: Vec<String>,
    #[serde(default)]
    login_url: Option<String>,
    #[serde(default)]
    preferred_token_signing_key_thumbprint: Option<String>,
    #[serde(default)]
    key_credentials: Vec<GraphKeyCredential>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphKeyCredential {
    #[serde(default)]
    usage: Option<String>,
    /// Base64 of the raw SHA-1 thumbprint.
    #[serde(default)]
    custom_key_identifier: Option<String>,
}

impl GraphKeyCredential {
    /// Upper-case hex thumbprint of a `Sign` key.
    fn signing_thumbprint(&self) -> Option<String> {
        if !self.usage.as_deref().is_some_and(|u| u.eq_ignore_ascii_case("Sign")) {
            return None;
        }
        let identifier = self.custom_key_identifier.as_deref()?;
        match STANDARD.decode(identifier) {
            Ok(bytes) => Some(bytes.iter().map(|b| format!("{b:02X}")).collect()),
            Err(_) => Some(identifier.to_string()),
        }
    }
}

impl From<GraphServicePrincipal> for ServicePrincipal {
    fn from(sp: GraphServicePrincipal) -> Self {
        ServicePrincipal {
            signing_key_thumbprints: sp
                .key_credentials
                .iter()
                .filter_map(GraphKeyCredential::signing_thumbprint)
                .collect(),
            id: sp.id,
            app_id: sp.app_id,
            preferred_single_sign_on_mode: sp.preferred_single_sign_on_mode,
            notification_email_addresses: sp.notification_email_addresses,
            login_url: sp.login_url,
            preferred_token_signing_key_thumbprint: sp.preferred_token_signing_key_thumbprint,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphAppRoleAssignment {
    principal_id: String,
    resource_id: String,
    app_role_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstantiatedTemplate {
    application: GraphApplication,
    service_principal: GraphServicePrincipal,
}

#[derive(Debug, Deserialize)]
struct SigningCertificate {
    thumbprint: String,
}

fn decode<T: DeserializeOwned>(what: &str, body: Value) -> ProviderResult<T> {
    serde_json::from_value(body)
        .map_err(|e| ProviderError::Transport(format!("unexpected {what} response: {e}")))
}

impl AzureCloud {
    fn graph_url(&self, path: &str, query: &[(&str, &str)]) -> ProviderResult<String> {
        build_url(&self.base.graph, &format!("{GRAPH_VERSION}{path}"), query)
    }

    /// First object of a filtered collection, if any.
    async fn graph_find_first(&self, collection: &str, filter: &str) -> ProviderResult<Option<Value>> {
        let url = self.graph_url(collection, &[("$filter", filter)])?;
        let mut items = self.rest.list(Audience::Graph, &url).await?;
        if items.len() > 1 {
            tracing::warn!(collection, filter, count = items.len(), "Filter matched several objects, using the first");
        }
        Ok((!items.is_empty()).then(|| items.swap_remove(0)))
    }

    pub(super) async fn probe_security_group(
        &self,
        display_name: &str,
    ) -> ProviderResult<Option<ResourceRef>> {
        let filter = format!("displayName eq {}", odata_literal(display_name));
        match self.graph_find_first("/groups", &filter).await? {
            Some(body) => {
                let group: GraphObject = decode("group", body)?;
                Ok(Some(ResourceRef::new(group.id.clone()).with_principal_id(group.id)))
            }
            None => Ok(None),
        }
    }

    pub(super) async fn create_security_group(
        &self,
        display_name: &str,
        mail_nickname: &str,
        description: Option<&str>,
    ) -> ProviderResult<ResourceRef> {
        let url = self.graph_url("/groups", &[])?;
        let mut body = json!({
            "displayName": display_name,
            "mailNickname": mail_nickname,
            "mailEnabled": false,
            "securityEnabled": true,
        });
        if let Some(description) = description {
            body["description"] = json!(description);
        }
        let created = self
            .rest
            .call(Audience::Graph, Method::POST, &url, Some(&body), Idempotency::Mutation)
            .await?;
        let group: GraphObject = decode("group", created)?;
        Ok(ResourceRef::new(group.id.clone()).with_principal_id(group.id))
    }

    pub(super) async fn create_application(
        &self,
        display_name: &str,
        sign_in_audience: &str,
    ) -> ProviderResult<ResourceRef> {
        let url = self.graph_url("/applications", &[])?;
        let body = json!({ "displayName": display_name, "signInAudience": sign_in_audience });
        let created = self
            .rest
            .call(Audience::Graph, Method::POST, &url, Some(&body), Idempotency::Mutation)
            .await?;
        let app: GraphApplication = decode("application", created)?;
        Ok(ResourceRef::new(app.id).with_client_id(app.app_id))
    }

    pub(super) async fn directory_object_exists(&self, id: &str) -> ProviderResult<bool> {
        let url = self.graph_url(&format!("/directoryObjects/{id}"), &[("$select", "id")])?;
        Ok(self.rest.get_optional(Audience::Graph, &url).await?.is_some())
    }

    pub(super) async fn add_member(&self, edge: &GroupMembershipEdge) -> ProviderResult<()> {
        let url = self.graph_url(&format!("/groups/{}/members/$ref", edge.group_id), &[])?;
        let body = json!({
            "@odata.id": format!(
                "{}{GRAPH_VERSION}/directoryObjects/{}",
                self.base.graph.trim_end_matches('/'),
                edge.member_id
            ),
        });
        self.rest
            .call(Audience::Graph, Method::POST, &url, Some(&body), Idempotency::Mutation)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ApplicationApi for AzureCloud {
    async fn find_application(&self, display_name: &str) -> ProviderResult<Option<Application>> {
        let filter = format!("displayName eq {}", odata_literal(display_name));
        match self.graph_find_first("/applications", &filter).await? {
            Some(body) => Ok(Some(decode::<GraphApplication>("application", body)?.into())),
            None => Ok(None),
        }
    }

    async fn find_service_principal(
        &self,
        app_id: &str,
    ) -> ProviderResult<Option<ServicePrincipal>> {
        let filter = format!("appId eq {}", odata_literal(app_id));
        match self.graph_find_first("/servicePrincipals", &filter).await? {
            Some(body) => Ok(Some(
                decode::<GraphServicePrincipal>("service principal", body)?.into(),
            )),
            None => Ok(None),
        }
    }

    async fn instantiate_template(
        &self,
        template_id: &str,
        display_name: &str,
    ) -> ProviderResult<(Application, ServicePrincipal)> {
        let url = self.graph_url(&format!("/applicationTemplates/{template_id}/instantiate"), &[])?;
        let body = json!({ "displayName": display_name });
        let response = self
            .rest
            .call(Audience::Graph, Method::POST, &url, Some(&body), Idempotency::Mutation)
            .await?;
        let instantiated: InstantiatedTemplate = decode("template instantiation", response)?;
        Ok((
            instantiated.application.into(),
            instantiated.service_principal.into(),
        ))
    }

    async fn create_service_principal(&self, app_id: &str) -> ProviderResult<ServicePrincipal> {
        let url = self.graph_url("/servicePrincipals", &[])?;
        let body = json!({ "appId": app_id });
        let created = self
            .rest
            .call(Audience::Graph, Method::POST, &url, Some(&body), Idempotency::Mutation)
            .await?;
        Ok(decode::<GraphServicePrincipal>("service principal", created)?.into())
    }

    async fn update_application(
        &self,
        object_id: &str,
        patch: &ApplicationPatch,
    ) -> ProviderResult<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut body = Map::new();
        if let Some(uris) = &patch.identifier_uris {
            body.insert("identifierUris".into(), json!(uris));
        }
        let mut web = Map::new();
        if let Some(uris) = &patch.redirect_uris {
            web.insert("redirectUris".into(), json!(uris));
        }
        if let Some(url) = &patch.logout_url {
            web.insert("logoutUrl".into(), json!(url));
        }
        if !web.is_empty() {
            body.insert("web".into(), Value::Object(web));
        }
        if let Some(claims) = &patch.group_membership_claims {
            body.insert("groupMembershipClaims".into(), json!(claims));
        }

        let url = self.graph_url(&format!("/applications/{object_id}"), &[])?;
        self.rest
            .call(
                Audience::Graph,
                Method::PATCH,
                &url,
                Some(&Value::Object(body)),
                Idempotency::Idempotent,
            )
            .await?;
        Ok(())
    }

    async fn update_service_principal(
        &self,
        id: &str,
        patch: &ServicePrincipalPatch,
    ) -> ProviderResult<()> {
        if patch.is_empty() {
            return Ok(());
        }

        let mut body = Map::new();
        if let Some(mode) = &patch.preferred_single_sign_on_mode {
            body.insert("preferredSingleSignOnMode".into(), json!(mode));
        }
        if let Some(emails) = &patch.notification_email_addresses {
            body.insert("notificationEmailAddresses".into(), json!(emails));
        }
        if let Some(url) = &patch.login_url {
            body.insert("loginUrl".into(), json!(url));
        }

        let url = self.graph_url(&format!("/servicePrincipals/{id}"), &[])?;
        self.rest
            .call(
                Audience::Graph,
                Method::PATCH,
                &url,
                Some(&Value::Object(body)),
                Idempotency::Idempotent,
            )
            .await?;
        Ok(())
    }

    async fn add_token_signing_certificate(
        &self,
        service_principal_id: &str,
        display_name: &str,
        end_date_time: chrono::DateTime<chrono::Utc>,
    ) -> ProviderResult<String> {
        let url = self.graph_url(
            &format!("/servicePrincipals/{service_principal_id}/addTokenSigningCertificate"),
            &[],
        )?;
        let body = json!({
            "displayName": display_name,
            "endDateTime": end_date_time.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        });
        let response = self
            .rest
            .call(Audience::Graph, Method::POST, &url, Some(&body), Idempotency::Mutation)
            .await?;
        let certificate: SigningCertificate = decode("signing certificate", response)?;
        Ok(certificate.thumbprint)
    }

    async fn set_preferred_signing_key(
        &self,
        service_principal_id: &str,
        thumbprint: &str,
    ) -> ProviderResult<()> {
        let url = self.graph_url(&format!("/servicePrincipals/{service_principal_id}"), &[])?;
        let body = json!({ "preferredTokenSigningKeyThumbprint": thumbprint });
        self.rest
            .call(Audience::Graph, Method::PATCH, &url, Some(&body), Idempotency::Idempotent)
            .await?;
        Ok(())
    }

    async fn list_app_role_assignments(
        &self,
        service_principal_id: &str,
    ) -> ProviderResult<Vec<AppRoleAssignmentEdge>> {
        let url = self.graph_url(
            &format!("/servicePrincipals/{service_principal_id}/appRoleAssignedTo"),
            &[],
        )?;
        self.rest
            .list(Audience::Graph, &url)
            .await?
            .into_iter()
            .map(|item| {
                let assignment: GraphAppRoleAssignment = decode("app role assignment", item)?;
                Ok(AppRoleAssignmentEdge {
                    service_principal_id: assignment.resource_id,
                    principal_id: assignment.principal_id,
                    app_role_id: assignment.app_role_id,
                })
            })
            .collect()
    }

    async fn create_app_role_assignment(&self, edge: &AppRoleAssignmentEdge) -> ProviderResult<()> {
        let url = self.graph_url(
            &format!("/servicePrincipals/{}/appRoleAssignedTo", edge.service_principal_id),
            &[],
        )?;
        let body = json!({
            "principalId": edge.principal_id,
            "resourceId": edge.service_principal_id,
            "appRoleId": edge.app_role_id,
        });
        self.rest
            .call(Audience::Graph, Method::POST, &url, Some(&body), Idempotency::Mutation)
            .await?;
        Ok(())
    }
}
