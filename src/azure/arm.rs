//! Azure Resource Manager calls.

use std::collections::BTreeMap;

use reqwest::Method;
use serde_json::{Value, json};

use super::{
    AzureCloud,
    rest::{Idempotency, build_url, odata_literal},
    token::Audience,
};
use crate::{
    provider::{ProviderError, ProviderResult, ResourceRef, SessionInfo},
    reconcile::PrincipalType,
};

const RESOURCES_API_VERSION: &str = "2021-04-01";
const SUBSCRIPTIONS_API_VERSION: &str = "2022-12-01";
const MANAGED_IDENTITY_API_VERSION: &str = "2023-01-31";
const AUTHORIZATION_API_VERSION: &str = "2022-04-01";

impl AzureCloud {
    fn arm_url(&self, path: &str, api_version: &str, filter: Option<&str>) -> ProviderResult<String> {
        let mut query = Vec::with_capacity(2);
        if let Some(filter) = filter {
            query.push(("$filter", filter));
        }
        query.push(("api-version", api_version));
        build_url(&self.base.management, path, &query)
    }

    fn resource_group_path(&self, name: &str) -> String {
        format!("/subscriptions/{}/resourcegroups/{}", self.subscription_id, name)
    }

    fn managed_identity_path(&self, resource_group: &str, name: &str) -> String {
        format!(
            "/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ManagedIdentity/userAssignedIdentities/{}",
            self.subscription_id, resource_group, name
        )
    }

    /// Resolve the configured subscription. A 404 or 403 means the session
    /// cannot see it.
    pub(super) async fn subscription_session(&self) -> ProviderResult<SessionInfo> {
        let url = self.arm_url(
            &format!("/subscriptions/{}", self.subscription_id),
            SUBSCRIPTIONS_API_VERSION,
            None,
        )?;
        let body = self
            .rest
            .get_optional(Audience::Management, &url)
            .await?
            .ok_or_else(|| {
                ProviderError::NotFound(format!(
                    "subscription '{}' is not visible to this session",
                    self.subscription_id
                ))
            })?;

        Ok(SessionInfo {
            subscription_id: self.subscription_id.clone(),
            tenant_id: str_field(&body, "tenantId"),
            subscription_name: str_field(&body, "displayName"),
        })
    }

    pub(super) async fn probe_resource_group(&self, name: &str) -> ProviderResult<Option<ResourceRef>> {
        let url = self.arm_url(&self.resource_group_path(name), RESOURCES_API_VERSION, None)?;
        Ok(self
            .rest
            .get_optional(Audience::Management, &url)
            .await?
            .map(|body| arm_resource_ref(&body)))
    }

    pub(super) async fn create_resource_group(
        &self,
        name: &str,
        location: &str,
        tags: &BTreeMap<String, String>,
    ) -> ProviderResult<ResourceRef> {
        let url = self.arm_url(&self.resource_group_path(name), RESOURCES_API_VERSION, None)?;
        let body = json!({ "location": location, "tags": tags });
        let created = self
            .rest
            .call(Audience::Management, Method::PUT, &url, Some(&body), Idempotency::Idempotent)
            .await?;
        Ok(arm_resource_ref(&created))
    }

    pub(super) async fn probe_managed_identity(
        &self,
        resource_group: &str,
        name: &str,
    ) -> ProviderResult<Option<ResourceRef>> {
        let url = self.arm_url(
            &self.managed_identity_path(resource_group, name),
            MANAGED_IDENTITY_API_VERSION,
            None,
        )?;
        Ok(self
            .rest
            .get_optional(Audience::Management, &url)
            .await?
            .map(|body| arm_resource_ref(&body)))
    }

    pub(super) async fn create_managed_identity(
        &self,
        resource_group: &str,
        name: &str,
        location: &str,
        tags: &BTreeMap<String, String>,
    ) -> ProviderResult<ResourceRef> {
        let url = self.arm_url(
            &self.managed_identity_path(resource_group, name),
            MANAGED_IDENTITY_API_VERSION,
            None,
        )?;
        let body = json!({ "location": location, "tags": tags });
        let created = self
            .rest
            .call(Audience::Management, Method::PUT, &url, Some(&body), Idempotency::Idempotent)
            .await?;
        Ok(arm_resource_ref(&created))
    }

    pub(super) async fn probe_federated_credential(
        &self,
        resource_group: &str,
        identity_name: &str,
        name: &str,
    ) -> ProviderResult<Option<ResourceRef>> {
        let path = format!(
            "{}/federatedIdentityCredentials/{}",
            self.managed_identity_path(resource_group, identity_name),
            name
        );
        let url = self.arm_url(&path, MANAGED_IDENTITY_API_VERSION, None)?;
        Ok(self
            .rest
            .get_optional(Audience::Management, &url)
            .await?
            .map(|body| arm_resource_ref(&body)))
    }

    pub(super) async fn create_federated_credential(
        &self,
        resource_group: &str,
        identity_name: &str,
        name: &str,
        issuer: &str,
        subject: &str,
        audiences: &[String],
    ) -> ProviderResult<ResourceRef> {
        let path = format!(
            "{}/federatedIdentityCredentials/{}",
            self.managed_identity_path(resource_group, identity_name),
            name
        );
        let url = self.arm_url(&path, MANAGED_IDENTITY_API_VERSION, None)?;
        let body = json!({
            "properties": {
                "issuer": issuer,
                "subject": subject,
                "audiences": audiences,
            }
        });
        let created = self
            .rest
            .call(Audience::Management, Method::PUT, &url, Some(&body), Idempotency::Idempotent)
            .await?;
        Ok(arm_resource_ref(&created))
    }

    /// Role definition id for `role_name` at `scope`, cached per run.
    pub(super) async fn role_definition(
        &self,
        scope: &str,
        role_name: &str,
    ) -> ProviderResult<Option<String>> {
        let key = (scope.to_lowercase(), role_name.to_string());
        if let Some(id) = self.role_definitions.get(&key) {
            return Ok(Some(id.clone()));
        }

        let filter = format!("roleName eq {}", odata_literal(role_name));
        let url = self.arm_url(
            &format!("{scope}/providers/Microsoft.Authorization/roleDefinitions"),
            AUTHORIZATION_API_VERSION,
            Some(&filter),
        )?;
        let definitions = self.rest.list(Audience::Management, &url).await?;
        let id = definitions
            .iter()
            .find_map(|d| str_field(d, "id"));

        if let Some(id) = &id {
            self.role_definitions.insert(key, id.clone());
        }
        Ok(id)
    }

    /// Assignment of `role_name` to `principal_id` made exactly at `scope`.
    /// Inherited assignments from parent scopes do not count.
    pub(super) async fn probe_role_assignment(
        &self,
        principal_id: &str,
        scope: &str,
        role_name: &str,
    ) -> ProviderResult<Option<ResourceRef>> {
        let Some(role_definition_id) = self.role_definition(scope, role_name).await? else {
            return Ok(None);
        };

        let filter = format!("principalId eq {}", odata_literal(principal_id));
        let url = self.arm_url(
            &format!("{scope}/providers/Microsoft.Authorization/roleAssignments"),
            AUTHORIZATION_API_VERSION,
            Some(&filter),
        )?;
        let assignments = self.rest.list(Audience::Management, &url).await?;

        let found = assignments.iter().find(|a| {
            let props = &a["properties"];
            let same_scope = props["scope"]
                .as_str()
                .is_some_and(|s| s.eq_ignore_ascii_case(scope));
            let same_role = props["roleDefinitionId"]
                .as_str()
                .is_some_and(|id| same_definition(id, &role_definition_id));
            same_scope && same_role
        });

        Ok(found.map(|a| arm_resource_ref(a).with_principal_id(principal_id)))
    }

    pub(super) async fn create_role_assignment(
        &self,
        principal_id: &str,
        principal_type: PrincipalType,
        scope: &str,
        role_definition_id: &str,
    ) -> ProviderResult<ResourceRef> {
        let url = self.arm_url(
            &format!(
                "{scope}/providers/Microsoft.Authorization/roleAssignments/{}",
                uuid::Uuid::new_v4()
            ),
            AUTHORIZATION_API_VERSION,
            None,
        )?;
        let body = json!({
            "properties": {
                "roleDefinitionId": role_definition_id,
                "principalId": principal_id,
                "principalType": principal_type.as_str(),
            }
        });

        let created = self
            .rest
            .call(Audience::Management, Method::PUT, &url, Some(&body), Idempotency::Idempotent)
            .await?;
        Ok(arm_resource_ref(&created).with_principal_id(principal_id))
    }
}

/// Role definition ids differ in prefix depending on where they were read;
/// the trailing GUID identifies the role.
fn same_definition(a: &str, b: &str) -> bool {
    let tail = |id: &str| id.rsplit('/').next().unwrap_or(id).to_lowercase();
    tail(a) == tail(b)
}

fn str_field(body: &Value, field: &str) -> Option<String> {
    body.get(field).and_then(Value::as_str).map(str::to_string)
}

fn arm_resource_ref(body: &Value) -> ResourceRef {
    let mut resource = ResourceRef::new(str_field(body, "id").unwrap_or_default());
    if let Some(principal_id) = body["properties"]["principalId"].as_str() {
        resource = resource.with_principal_id(principal_id);
    }
    if let Some(client_id) = body["properties"]["clientId"].as_str() {
        resource = resource.with_client_id(client_id);
    }
    resource
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_partial_json, method, path, path_regex, query_param},
    };

    use super::*;
    use crate::{
        azure::test_support::{SUBSCRIPTION, cloud},
        provider::ResourceApi,
        reconcile::ResourceSpec,
    };

    const CONTRIBUTOR: &str = "b24988ac-6180-42a0-ab88-20f7382dd24c";

    fn rg_scope() -> String {
        format!("/subscriptions/{SUBSCRIPTION}/resourceGroups/rg-opencti-001")
    }

    async fn mock_contributor(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path(format!(
                "{}/providers/Microsoft.Authorization/roleDefinitions",
                rg_scope()
            )))
            .and(query_param("$filter", "roleName eq 'Contributor'"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{
                    "id": format!("/subscriptions/{SUBSCRIPTION}/providers/Microsoft.Authorization/roleDefinitions/{CONTRIBUTOR}"),
                    "properties": { "roleName": "Contributor" }
                }]
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_resource_group_probe_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/subscriptions/{SUBSCRIPTION}/resourcegroups/rg-opencti-001")))
            .and(query_param("api-version", RESOURCES_API_VERSION))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "error": { "code": "ResourceGroupNotFound", "message": "not found" }
            })))
            .mount(&server)
            .await;

        let spec = ResourceSpec::resource_group("rg-opencti-001", "westeurope");
        assert!(cloud(&server.uri()).probe(&spec).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resource_group_create() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path(format!("/subscriptions/{SUBSCRIPTION}/resourcegroups/rg-opencti-001")))
            .and(body_partial_json(json!({ "location": "westeurope" })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": rg_scope(),
                "name": "rg-opencti-001",
                "location": "westeurope",
            })))
            .expect(1)
            .mount(&server)
            .await;

        let spec = ResourceSpec::resource_group("rg-opencti-001", "westeurope");
        let created = cloud(&server.uri()).create(&spec).await.unwrap();
        assert_eq!(created.id, rg_scope());
    }

    #[tokio::test]
    async fn test_managed_identity_create_reads_ids() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path_regex(r"/userAssignedIdentities/id-opencti-001$"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "id": format!("{}/providers/Microsoft.ManagedIdentity/userAssignedIdentities/id-opencti-001", rg_scope()),
                "properties": { "principalId": "pid-1", "clientId": "cid-1", "tenantId": "t" }
            })))
            .mount(&server)
            .await;

        let spec = ResourceSpec::managed_identity("id-opencti-001", "rg-opencti-001", "westeurope");
        let created = cloud(&server.uri()).create(&spec).await.unwrap();

        assert_eq!(created.principal_id.as_deref(), Some("pid-1"));
        assert_eq!(created.client_id.as_deref(), Some("cid-1"));
    }

    #[tokio::test]
    async fn test_session_reads_tenant() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(format!("/subscriptions/{SUBSCRIPTION}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "subscriptionId": SUBSCRIPTION,
                "tenantId": "tenant-1",
                "displayName": "CTI Production",
            })))
            .mount(&server)
            .await;

        let session = cloud(&server.uri()).check_session().await.unwrap();
        assert_eq!(session.tenant_id.as_deref(), Some("tenant-1"));
        assert_eq!(session.subscription_name.as_deref(), Some("CTI Production"));
    }

    #[tokio::test]
    async fn test_session_missing_subscription() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = cloud(&server.uri()).check_session().await.unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_role_definition_is_cached() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"/roleDefinitions$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{ "id": format!("/providers/Microsoft.Authorization/roleDefinitions/{CONTRIBUTOR}") }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let cloud = cloud(&server.uri());
        let first = cloud.find_role_definition(&rg_scope(), "Contributor").await.unwrap();
        let second = cloud
            .find_role_definition(&rg_scope().to_uppercase(), "Contributor")
            .await
            .unwrap();
        assert_eq!(first, second);
        assert!(first.unwrap().ends_with(CONTRIBUTOR));
    }

    #[tokio::test]
    async fn test_role_assignment_probe_ignores_inherited() {
        let server = MockServer::start().await;
        mock_contributor(&server).await;
        Mock::given(method("GET"))
            .and(path(format!(
                "{}/providers/Microsoft.Authorization/roleAssignments",
                rg_scope()
            )))
            .and(query_param("$filter", "principalId eq 'pid-1'"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{
                    "id": "/subscriptions/x/providers/Microsoft.Authorization/roleAssignments/inherited",
                    "properties": {
                        "scope": format!("/subscriptions/{SUBSCRIPTION}"),
                        "roleDefinitionId": format!("/subscriptions/{SUBSCRIPTION}/providers/Microsoft.Authorization/roleDefinitions/{CONTRIBUTOR}"),
                        "principalId": "pid-1",
                    }
                }]
            })))
            .mount(&server)
            .await;

        let spec = ResourceSpec::role_assignment(
            "pid-1",
            PrincipalType::ServicePrincipal,
            rg_scope(),
            "Contributor",
        );
        assert!(cloud(&server.uri()).probe(&spec).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_role_assignment_probe_matches_exact_scope() {
        let server = MockServer::start().await;
        mock_contributor(&server).await;
        Mock::given(method("GET"))
            .and(path_regex(r"/roleAssignments$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{
                    "id": format!("{}/providers/Microsoft.Authorization/roleAssignments/ra-1", rg_scope()),
                    "properties": {
                        "scope": rg_scope().to_lowercase(),
                        "roleDefinitionId": format!("/providers/Microsoft.Authorization/roleDefinitions/{}", CONTRIBUTOR.to_uppercase()),
                        "principalId": "pid-1",
                    }
                }]
            })))
            .mount(&server)
            .await;

        let spec = ResourceSpec::role_assignment(
            "pid-1",
            PrincipalType::ServicePrincipal,
            rg_scope(),
            "Contributor",
        );
        let found = cloud(&server.uri()).probe(&spec).await.unwrap().unwrap();
        assert!(found.id.ends_with("/ra-1"));
    }

    #[tokio::test]
    async fn test_role_assignment_exists_is_conflict() {
        let server = MockServer::start().await;
        mock_contributor(&server).await;
        Mock::given(method("PUT"))
            .and(path_regex(r"/roleAssignments/[0-9a-f-]{36}$"))
            .and(body_partial_json(json!({
                "properties": { "principalId": "pid-1", "principalType": "ServicePrincipal" }
            })))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "error": { "code": "RoleAssignmentExists", "message": "The role assignment already exists." }
            })))
            .mount(&server)
            .await;

        let spec = ResourceSpec::role_assignment(
            "pid-1",
            PrincipalType::ServicePrincipal,
            rg_scope(),
            "Contributor",
        );
        let err = cloud(&server.uri()).create(&spec).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_same_definition_compares_guid() {
        assert!(same_definition(
            "/subscriptions/s/providers/Microsoft.Authorization/roleDefinitions/ABC",
            "/providers/Microsoft.Authorization/roleDefinitions/abc"
        ));
        assert!(!same_definition("/x/roleDefinitions/abc", "/x/roleDefinitions/abd"));
    }
}
