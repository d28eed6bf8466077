//! In-memory cloud backend.
//!
//! Models just enough of ARM and Microsoft Graph for dry runs and tests:
//! natural-key lookups, conflicts on duplicates, call counters and injectable
//! faults.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{
    AppRole, AppRoleAssignmentEdge, Application, ApplicationApi, ApplicationPatch,
    GroupMembershipEdge, MemberKind, ProviderError, ProviderResult, ResourceApi, ResourceRef,
    ServicePrincipal, ServicePrincipalPatch, SessionInfo,
};
use crate::reconcile::{DesiredAttributes, ResourceKind, ResourceSpec};

const DEFAULT_SUBSCRIPTION_ID: &str = "00000000-0000-0000-0000-00000000c7a1";

/// Built-in roles known to every in-memory subscription.
const BUILT_IN_ROLES: &[(&str, &str)] = &[
    ("Owner", "8e3af657-a8ff-443c-a75c-2fe8c4bcb635"),
    ("Contributor", "b24988ac-6180-42a0-ab88-20f7382dd24c"),
    ("Reader", "acdd72a7-3385-48ef-bd42-f606fba81ae7"),
    ("AcrPull", "7f951dda-4ed3-4680-a7ca-43fe172d538d"),
    ("Key Vault Secrets User", "4633458b-17de-408a-b874-0445c86b69e6"),
    ("Storage Blob Data Contributor", "ba92f5b4-2d11-453d-a403-e96b0029c9fe"),
];

/// Provider operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryOp {
    CheckSession,
    FindRoleDefinition,
    PrincipalVisible,
    AddGroupMember,
    FindApplication,
    FindServicePrincipal,
    InstantiateTemplate,
    CreateServicePrincipal,
    UpdateApplication,
    UpdateServicePrincipal,
    AddTokenSigningCertificate,
    SetPreferredSigningKey,
    ListAppRoleAssignments,
    CreateAppRoleAssignment,
}

/// Where an injected error is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryFault {
    /// `probe` for a kind fails.
    Probe(ResourceKind),
    /// `create` for a kind fails without storing anything.
    Create(ResourceKind),
    /// `create` stores the resource, then reports the error (a lost response).
    CreateConflictAfterInsert(ResourceKind),
    /// Any other operation fails.
    Op(MemoryOp),
}

#[derive(Debug, Clone)]
struct RoleAssignmentRecord {
    principal_id: String,
    scope: String,
    role_definition_id: String,
    resource: ResourceRef,
}

/// In-memory implementation of [`ResourceApi`] and [`ApplicationApi`].
///
/// Faults stay armed until [`MemoryCloud::clear_faults`] is called.
pub struct MemoryCloud {
    subscription_id: String,
    tenant_id: Option<String>,
    resources: DashMap<(ResourceKind, String), ResourceRef>,
    role_definitions: DashMap<String, String>,
    role_assignments: DashMap<String, RoleAssignmentRecord>,
    memberships: DashMap<(String, String), MemberKind>,
    applications: DashMap<String, Application>,
    service_principals: DashMap<String, ServicePrincipal>,
    app_role_assignments: DashMap<(String, String, String), AppRoleAssignmentEdge>,
    create_calls: DashMap<ResourceKind, usize>,
    probe_calls: DashMap<ResourceKind, usize>,
    op_calls: DashMap<MemoryOp, usize>,
    faults: DashMap<MemoryFault, ProviderError>,
    hidden_principal_checks: AtomicUsize,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::with_subscription(DEFAULT_SUBSCRIPTION_ID)
    }

    pub fn with_subscription(subscription_id: impl Into<String>) -> Self {
        let role_definitions = DashMap::new();
        for (name, guid) in BUILT_IN_ROLES {
            role_definitions.insert(name.to_string(), guid.to_string());
        }

        Self {
            subscription_id: subscription_id.into(),
            tenant_id: None,
            resources: DashMap::new(),
            role_definitions,
            role_assignments: DashMap::new(),
            memberships: DashMap::new(),
            applications: DashMap::new(),
            service_principals: DashMap::new(),
            app_role_assignments: DashMap::new(),
            create_calls: DashMap::new(),
            probe_calls: DashMap::new(),
            op_calls: DashMap::new(),
            faults: DashMap::new(),
            hidden_principal_checks: AtomicUsize::new(0),
        }
    }

    /// Tenant reported by `check_session`.
    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Arm a fault.
    pub fn inject(&self, fault: MemoryFault, error: ProviderError) {
        self.faults.insert(fault, error);
    }

    pub fn clear_faults(&self) {
        self.faults.clear();
    }

    /// Report principals as invisible for the next `checks` visibility checks.
    pub fn hide_principals_for(&self, checks: usize) {
        self.hidden_principal_checks.store(checks, Ordering::SeqCst);
    }

    /// Register a custom role definition.
    pub fn define_role(&self, name: impl Into<String>, guid: impl Into<String>) {
        self.role_definitions.insert(name.into(), guid.into());
    }

    pub fn create_calls(&self, kind: ResourceKind) -> usize {
        self.create_calls.get(&kind).map(|c| *c).unwrap_or(0)
    }

    pub fn probe_calls(&self, kind: ResourceKind) -> usize {
        self.probe_calls.get(&kind).map(|c| *c).unwrap_or(0)
    }

    pub fn op_calls(&self, op: MemoryOp) -> usize {
        self.op_calls.get(&op).map(|c| *c).unwrap_or(0)
    }

    /// Number of stored role assignments.
    pub fn role_assignment_count(&self) -> usize {
        self.role_assignments.len()
    }

    pub fn has_member(&self, group_id: &str, member_id: &str) -> bool {
        self.memberships
            .contains_key(&(group_id.to_string(), member_id.to_string()))
    }

    /// Snapshot of an application by display name.
    pub fn application(&self, display_name: &str) -> Option<Application> {
        self.applications
            .iter()
            .find(|a| a.display_name == display_name)
            .map(|a| a.value().clone())
    }

    /// Snapshot of a service principal by client id.
    pub fn service_principal(&self, app_id: &str) -> Option<ServicePrincipal> {
        self.service_principals
            .iter()
            .find(|sp| sp.app_id == app_id)
            .map(|sp| sp.value().clone())
    }

    /// Insert an application without a service principal, as left behind by
    /// an interrupted template instantiation.
    pub fn seed_application(&self, display_name: &str) -> Application {
        let app = new_application(display_name, template_app_roles());
        self.applications.insert(app.object_id.clone(), app.clone());
        app
    }

    fn op(&self, op: MemoryOp) -> ProviderResult<()> {
        *self.op_calls.entry(op).or_insert(0) += 1;
        match self.faults.get(&MemoryFault::Op(op)) {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    fn fault(&self, fault: MemoryFault) -> Option<ProviderError> {
        self.faults.get(&fault).map(|e| e.clone())
    }

    fn role_definition_id(&self, role_name: &str) -> Option<String> {
        self.role_definitions.get(role_name).map(|guid| {
            format!(
                "/subscriptions/{}/providers/Microsoft.Authorization/roleDefinitions/{}",
                self.subscription_id,
                guid.value()
            )
        })
    }

    /// Key under which a spec is stored; ARM names are case-insensitive.
    fn storage_key(spec: &ResourceSpec) -> String {
        match &spec.desired {
            DesiredAttributes::ResourceGroup { .. } => spec.natural_key.to_lowercase(),
            DesiredAttributes::ManagedIdentity { resource_group, .. } => {
                format!("{}/{}", resource_group, spec.natural_key).to_lowercase()
            }
            DesiredAttributes::FederatedCredential {
                resource_group,
                identity_name,
                ..
            } => format!("{resource_group}/{identity_name}/{}", spec.natural_key).to_lowercase(),
            _ => spec.natural_key.clone(),
        }
    }

    fn probe_inner(&self, spec: &ResourceSpec) -> ProviderResult<Option<ResourceRef>> {
        match &spec.desired {
            DesiredAttributes::Application { .. } => Ok(self
                .application(&spec.natural_key)
                .map(|app| ResourceRef::new(app.object_id).with_client_id(app.app_id))),
            DesiredAttributes::ServicePrincipal { app_id } => Ok(self
                .service_principal(app_id)
                .map(|sp| ResourceRef::new(sp.id.clone()).with_principal_id(sp.id).with_client_id(sp.app_id))),
            DesiredAttributes::RoleAssignment {
                principal_id,
                scope,
                role_name,
                ..
            } => {
                let Some(role_definition_id) = self.role_definition_id(role_name) else {
                    return Ok(None);
                };
                Ok(self
                    .role_assignments
                    .iter()
                    .find(|r| {
                        r.principal_id == *principal_id
                            && r.scope.eq_ignore_ascii_case(scope)
                            && r.role_definition_id == role_definition_id
                    })
                    .map(|r| r.resource.clone()))
            }
            _ => Ok(self
                .resources
                .get(&(spec.kind(), Self::storage_key(spec)))
                .map(|r| r.value().clone())),
        }
    }

    fn create_inner(&self, spec: &ResourceSpec) -> ProviderResult<ResourceRef> {
        if self.probe_inner(spec)?.is_some() {
            return Err(ProviderError::Conflict(format!(
                "{} '{}' already exists",
                spec.kind(),
                spec.natural_key
            )));
        }

        let sub = &self.subscription_id;
        let resource = match &spec.desired {
            DesiredAttributes::ResourceGroup { .. } => {
                ResourceRef::new(format!("/subscriptions/{sub}/resourceGroups/{}", spec.natural_key))
            }
            DesiredAttributes::ManagedIdentity { resource_group, .. } => ResourceRef::new(format!(
                "/subscriptions/{sub}/resourceGroups/{resource_group}/providers/Microsoft.ManagedIdentity/userAssignedIdentities/{}",
                spec.natural_key
            ))
            .with_principal_id(new_id())
            .with_client_id(new_id()),
            DesiredAttributes::SecurityGroup { .. } => ResourceRef::new(new_id()),
            DesiredAttributes::FederatedCredential {
                resource_group,
                identity_name,
                ..
            } => {
                let identity = self.resources.get(&(
                    ResourceKind::ManagedIdentity,
                    format!("{resource_group}/{identity_name}").to_lowercase(),
                ));
                let Some(identity) = identity else {
                    return Err(ProviderError::NotFound(format!(
                        "managed identity '{identity_name}' not found"
                    )));
                };
                ResourceRef::new(format!(
                    "{}/federatedIdentityCredentials/{}",
                    identity.id, spec.natural_key
                ))
            }
            DesiredAttributes::Application { .. } => {
                let app = new_application(&spec.natural_key, Vec::new());
                let resource =
                    ResourceRef::new(app.object_id.clone()).with_client_id(app.app_id.clone());
                self.applications.insert(app.object_id.clone(), app);
                return Ok(resource);
            }
            DesiredAttributes::ServicePrincipal { app_id } => {
                let sp = self.insert_service_principal(app_id)?;
                return Ok(ResourceRef::new(sp.id.clone())
                    .with_principal_id(sp.id)
                    .with_client_id(sp.app_id));
            }
            DesiredAttributes::RoleAssignment {
                principal_id,
                scope,
                role_name,
                ..
            } => {
                let Some(role_definition_id) = self.role_definition_id(role_name) else {
                    return Err(ProviderError::Api {
                        status: 400,
                        code: "RoleDefinitionDoesNotExist".into(),
                        message: format!("role '{role_name}' does not exist"),
                    });
                };
                let resource = ResourceRef::new(format!(
                    "{scope}/providers/Microsoft.Authorization/roleAssignments/{}",
                    new_id()
                ))
                .with_principal_id(principal_id.clone());
                self.role_assignments.insert(
                    spec.natural_key.clone(),
                    RoleAssignmentRecord {
                        principal_id: principal_id.clone(),
                        scope: scope.clone(),
                        role_definition_id,
                        resource: resource.clone(),
                    },
                );
                return Ok(resource);
            }
        };

        self.resources
            .insert((spec.kind(), Self::storage_key(spec)), resource.clone());
        Ok(resource)
    }

    fn insert_service_principal(&self, app_id: &str) -> ProviderResult<ServicePrincipal> {
        if self.service_principal(app_id).is_some() {
            return Err(ProviderError::Conflict(format!(
                "service principal for '{app_id}' already exists"
            )));
        }
        let sp = ServicePrincipal {
            id: new_id(),
            app_id: app_id.to_string(),
            ..ServicePrincipal::default()
        };
        self.service_principals.insert(sp.id.clone(), sp.clone());
        Ok(sp)
    }
}

fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn new_application(display_name: &str, app_roles: Vec<AppRole>) -> Application {
    Application {
        object_id: new_id(),
        app_id: new_id(),
        display_name: display_name.to_string(),
        app_roles,
        ..Application::default()
    }
}

/// Roles carried by applications created from the non-gallery template.
fn template_app_roles() -> Vec<AppRole> {
    vec![
        AppRole {
            id: new_id(),
            value: None,
            display_name: Some("User".to_string()),
            is_enabled: true,
        },
        AppRole {
            id: new_id(),
            value: None,
            display_name: Some("msiam_access".to_string()),
            is_enabled: true,
        },
    ]
}

#[async_trait]
impl ResourceApi for MemoryCloud {
    async fn check_session(&self) -> ProviderResult<SessionInfo> {
        self.op(MemoryOp::CheckSession)?;
        Ok(SessionInfo {
            subscription_id: self.subscription_id.clone(),
            tenant_id: self.tenant_id.clone(),
            subscription_name: Some("in-memory".to_string()),
        })
    }

    async fn probe(&self, spec: &ResourceSpec) -> ProviderResult<Option<ResourceRef>> {
        let kind = spec.kind();
        *self.probe_calls.entry(kind).or_insert(0) += 1;
        if let Some(error) = self.fault(MemoryFault::Probe(kind)) {
            return Err(error);
        }
        self.probe_inner(spec)
    }

    async fn create(&self, spec: &ResourceSpec) -> ProviderResult<ResourceRef> {
        let kind = spec.kind();
        *self.create_calls.entry(kind).or_insert(0) += 1;
        if let Some(error) = self.fault(MemoryFault::Create(kind)) {
            return Err(error);
        }
        let created = self.create_inner(spec)?;
        if let Some(error) = self.fault(MemoryFault::CreateConflictAfterInsert(kind)) {
            return Err(error);
        }
        Ok(created)
    }

    async fn find_role_definition(
        &self,
        _scope: &str,
        role_name: &str,
    ) -> ProviderResult<Option<String>> {
        self.op(MemoryOp::FindRoleDefinition)?;
        Ok(self.role_definition_id(role_name))
    }

    async fn principal_visible(&self, _principal_id: &str) -> ProviderResult<bool> {
        self.op(MemoryOp::PrincipalVisible)?;
        let hidden = self
            .hidden_principal_checks
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        Ok(!hidden)
    }

    async fn add_group_member(&self, edge: &GroupMembershipEdge) -> ProviderResult<()> {
        self.op(MemoryOp::AddGroupMember)?;
        let key = (edge.group_id.clone(), edge.member_id.clone());
        if self.memberships.contains_key(&key) {
            return Err(ProviderError::Conflict(
                "One or more added object references already exist".into(),
            ));
        }
        self.memberships.insert(key, edge.member_kind);
        Ok(())
    }
}

#[async_trait]
impl ApplicationApi for MemoryCloud {
    async fn find_application(&self, display_name: &str) -> ProviderResult<Option<Application>> {
        self.op(MemoryOp::FindApplication)?;
        Ok(self.application(display_name))
    }

    async fn find_service_principal(
        &self,
        app_id: &str,
    ) -> ProviderResult<Option<ServicePrincipal>> {
        self.op(MemoryOp::FindServicePrincipal)?;
        Ok(self.service_principal(app_id))
    }

    async fn instantiate_template(
        &self,
        _template_id: &str,
        display_name: &str,
    ) -> ProviderResult<(Application, ServicePrincipal)> {
        self.op(MemoryOp::InstantiateTemplate)?;
        let app = new_application(display_name, template_app_roles());
        self.applications.insert(app.object_id.clone(), app.clone());
        let sp = self.insert_service_principal(&app.app_id)?;
        Ok((app, sp))
    }

    async fn create_service_principal(&self, app_id: &str) -> ProviderResult<ServicePrincipal> {
        self.op(MemoryOp::CreateServicePrincipal)?;
        self.insert_service_principal(app_id)
    }

    async fn update_application(
        &self,
        object_id: &str,
        patch: &ApplicationPatch,
    ) -> ProviderResult<()> {
        self.op(MemoryOp::UpdateApplication)?;
        let mut app = self
            .applications
            .get_mut(object_id)
            .ok_or_else(|| ProviderError::NotFound(format!("application '{object_id}'")))?;
        if let Some(uris) = &patch.identifier_uris {
            app.identifier_uris = uris.clone();
        }
        if let Some(uris) = &patch.redirect_uris {
            app.redirect_uris = uris.clone();
        }
        if let Some(url) = &patch.logout_url {
            app.logout_url = Some(url.clone());
        }
        if let Some(claims) = &patch.group_membership_claims {
            app.group_membership_claims = Some(claims.clone());
        }
        Ok(())
    }

    async fn update_service_principal(
        &self,
        id: &str,
        patch: &ServicePrincipalPatch,
    ) -> ProviderResult<()> {
        self.op(MemoryOp::UpdateServicePrincipal)?;
        let mut sp = self
            .service_principals
            .get_mut(id)
            .ok_or_else(|| ProviderError::NotFound(format!("service principal '{id}'")))?;
        if let Some(mode) = &patch.preferred_single_sign_on_mode {
            sp.preferred_single_sign_on_mode = Some(mode.clone());
        }
        if let Some(emails) = &patch.notification_email_addresses {
            sp.notification_email_addresses = emails.clone();
        }
        if let Some(url) = &patch.login_url {
            sp.login_url = Some(url.clone());
        }
        Ok(())
    }

    async fn add_token_signing_certificate(
        &self,
        service_principal_id: &str,
        _display_name: &str,
        _end_date_time: chrono::DateTime<chrono::Utc>,
    ) -> ProviderResult<String> {
        self.op(MemoryOp::AddTokenSigningCertificate)?;
        let mut sp = self.service_principals.get_mut(service_principal_id).ok_or_else(|| {
            ProviderError::NotFound(format!("service principal '{service_principal_id}'"))
        })?;
        // SHA-1 thumbprints are 40 hex characters.
        let mut thumbprint = format!(
            "{}{}",
            uuid::Uuid::new_v4().simple(),
            uuid::Uuid::new_v4().simple()
        )
        .to_uppercase();
        thumbprint.truncate(40);
        sp.signing_key_thumbprints.push(thumbprint.clone());
        Ok(thumbprint)
    }

    async fn set_preferred_signing_key(
        &self,
        service_principal_id: &str,
        thumbprint: &str,
    ) -> ProviderResult<()> {
        self.op(MemoryOp::SetPreferredSigningKey)?;
        let mut sp = self.service_principals.get_mut(service_principal_id).ok_or_else(|| {
            ProviderError::NotFound(format!("service principal '{service_principal_id}'"))
        })?;
        if !sp.signing_key_thumbprints.iter().any(|t| t == thumbprint) {
            return Err(ProviderError::Api {
                status: 400,
                code: "Request_BadRequest".into(),
                message: format!("no key credential with thumbprint {thumbprint}"),
            });
        }
        sp.preferred_token_signing_key_thumbprint = Some(thumbprint.to_string());
        Ok(())
    }

    async fn list_app_role_assignments(
        &self,
        service_principal_id: &str,
    ) -> ProviderResult<Vec<AppRoleAssignmentEdge>> {
        self.op(MemoryOp::ListAppRoleAssignments)?;
        let mut edges: Vec<_> = self
            .app_role_assignments
            .iter()
            .filter(|e| e.service_principal_id == service_principal_id)
            .map(|e| e.value().clone())
            .collect();
        edges.sort_by(|a, b| a.principal_id.cmp(&b.principal_id));
        Ok(edges)
    }

    async fn create_app_role_assignment(&self, edge: &AppRoleAssignmentEdge) -> ProviderResult<()> {
        self.op(MemoryOp::CreateAppRoleAssignment)?;
        let key = (
            edge.service_principal_id.clone(),
            edge.principal_id.clone(),
            edge.app_role_id.clone(),
        );
        if self.app_role_assignments.contains_key(&key) {
            return Err(ProviderError::Conflict(
                "Permission being assigned already exists on the object".into(),
            ));
        }
        self.app_role_assignments.insert(key, edge.clone());
        Ok(())
    }
}
