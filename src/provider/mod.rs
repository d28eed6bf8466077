//! Identity and resource provider boundary.
//!
//! Everything the reconciler and the SAML configurator know about the cloud
//! goes through the two traits in this module:
//! - [`ResourceApi`] - probe/create per resource kind, role definitions,
//!   role assignments and group membership
//! - [`ApplicationApi`] - application and service principal configuration
//!
//! Every read distinguishes "not found" (`Ok(None)`) from a failure
//! (`Err(ProviderError)`). Two backends implement both traits:
//! [`crate::azure::AzureCloud`] (ARM + Microsoft Graph) and [`MemoryCloud`]
//! (in-memory, used by dry runs and tests).

mod memory;

use std::fmt;

use async_trait::async_trait;
pub use memory::{MemoryCloud, MemoryFault, MemoryOp};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::reconcile::ResourceSpec;

/// Errors returned by a provider call.
///
/// Variants carry strings rather than transport error types so outcomes can
/// be cloned into reports and injected by the in-memory backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// The addressed resource does not exist (only for calls that require it).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The resource (or edge) already exists, or was created concurrently.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Network failure, timeout or undecodable response.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Credentials missing or rejected.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The provider rejected the request.
    #[error("API error ({status}): {code}: {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    /// The request was rejected locally before dispatch.
    #[error("Validation error: {0}")]
    Validation(String),
}

impl ProviderError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, ProviderError::Conflict(_))
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, ProviderError::Transport(_))
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Opaque reference to a provider resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    /// External identifier (ARM resource id or directory object id).
    pub id: String,
    /// Directory object id of the principal backing this resource, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal_id: Option<String>,
    /// Client (application) id, for managed identities and applications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl ResourceRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            principal_id: None,
            client_id: None,
        }
    }

    pub fn with_principal_id(mut self, principal_id: impl Into<String>) -> Self {
        self.principal_id = Some(principal_id.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

/// Kind of directory object being added to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberKind {
    User,
    Group,
    ServicePrincipal,
}

impl fmt::Display for MemberKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberKind::User => write!(f, "user"),
            MemberKind::Group => write!(f, "group"),
            MemberKind::ServicePrincipal => write!(f, "service_principal"),
        }
    }
}

/// A group membership edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembershipEdge {
    pub group_id: String,
    pub member_id: String,
    pub member_kind: MemberKind,
}

/// An app role assignment edge (group → service principal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRoleAssignmentEdge {
    pub service_principal_id: String,
    pub principal_id: String,
    pub app_role_id: String,
}

/// An application role declared on an application registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRole {
    pub id: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Live view of an application registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    /// Directory object id.
    pub object_id: String,
    /// Client id (`appId`).
    pub app_id: String,
    pub display_name: String,
    #[serde(default)]
    pub identifier_uris: Vec<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub logout_url: Option<String>,
    #[serde(default)]
    pub group_membership_claims: Option<String>,
    #[serde(default)]
    pub app_roles: Vec<AppRole>,
}

/// Live view of a service principal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicePrincipal {
    pub id: String,
    pub app_id: String,
    #[serde(default)]
    pub preferred_single_sign_on_mode: Option<String>,
    #[serde(default)]
    pub notification_email_addresses: Vec<String>,
    #[serde(default)]
    pub login_url: Option<String>,
    /// Thumbprint of the active token-signing certificate, if one is attached.
    #[serde(default)]
    pub preferred_token_signing_key_thumbprint: Option<String>,
    /// Thumbprints of every attached signing key, preferred or not.
    #[serde(default)]
    pub signing_key_thumbprints: Vec<String>,
}

/// Partial update for an application. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationPatch {
    pub identifier_uris: Option<Vec<String>>,
    pub redirect_uris: Option<Vec<String>>,
    pub logout_url: Option<String>,
    pub group_membership_claims: Option<String>,
}

impl ApplicationPatch {
    pub fn is_empty(&self) -> bool {
        self.identifier_uris.is_none()
            && self.redirect_uris.is_none()
            && self.logout_url.is_none()
            && self.group_membership_claims.is_none()
    }
}

/// Partial update for a service principal. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServicePrincipalPatch {
    pub preferred_single_sign_on_mode: Option<String>,
    pub notification_email_addresses: Option<Vec<String>>,
    pub login_url: Option<String>,
}

impl ServicePrincipalPatch {
    pub fn is_empty(&self) -> bool {
        self.preferred_single_sign_on_mode.is_none()
            && self.notification_email_addresses.is_none()
            && self.login_url.is_none()
    }
}

/// The subscription the authenticated session resolves to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub subscription_id: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub subscription_name: Option<String>,
}

/// Resource probe/create surface, plus the role and membership edges that
/// the reconciler manages alongside resources.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// Confirm credentials work and the subscription is reachable.
    async fn check_session(&self) -> ProviderResult<SessionInfo>;

    /// Look up the resource identified by the spec's natural key.
    async fn probe(&self, spec: &ResourceSpec) -> ProviderResult<Option<ResourceRef>>;

    /// Create the resource. Returns `Conflict` if it already exists.
    async fn create(&self, spec: &ResourceSpec) -> ProviderResult<ResourceRef>;

    /// Resolve a role definition by name at a scope. Returns its full id.
    async fn find_role_definition(
        &self,
        scope: &str,
        role_name: &str,
    ) -> ProviderResult<Option<String>>;

    /// Whether a principal is visible to the authorization backend yet.
    async fn principal_visible(&self, principal_id: &str) -> ProviderResult<bool>;

    /// Add a member to a group. Returns `Conflict` if the edge already exists.
    async fn add_group_member(&self, edge: &GroupMembershipEdge) -> ProviderResult<()>;
}

/// Application registration and service principal configuration surface.
#[async_trait]
pub trait ApplicationApi: Send + Sync {
    async fn find_application(&self, display_name: &str) -> ProviderResult<Option<Application>>;

    async fn find_service_principal(&self, app_id: &str)
    -> ProviderResult<Option<ServicePrincipal>>;

    /// Instantiate an application template, creating both the application
    /// and its service principal.
    async fn instantiate_template(
        &self,
        template_id: &str,
        display_name: &str,
    ) -> ProviderResult<(Application, ServicePrincipal)>;

    async fn create_service_principal(&self, app_id: &str) -> ProviderResult<ServicePrincipal>;

    async fn update_application(
        &self,
        object_id: &str,
        patch: &ApplicationPatch,
    ) -> ProviderResult<()>;

    async fn update_service_principal(
        &self,
        id: &str,
        patch: &ServicePrincipalPatch,
    ) -> ProviderResult<()>;

    /// Attach a new token-signing certificate. Returns its thumbprint.
    /// The certificate is not made the preferred signing key.
    async fn add_token_signing_certificate(
        &self,
        service_principal_id: &str,
        display_name: &str,
        end_date_time: chrono::DateTime<chrono::Utc>,
    ) -> ProviderResult<String>;

    /// Make an attached certificate the one federation metadata publishes.
    async fn set_preferred_signing_key(
        &self,
        service_principal_id: &str,
        thumbprint: &str,
    ) -> ProviderResult<()>;

    async fn list_app_role_assignments(
        &self,
        service_principal_id: &str,
    ) -> ProviderResult<Vec<AppRoleAssignmentEdge>>;

    /// Create an app role assignment. Returns `Conflict` on duplicates.
    async fn create_app_role_assignment(&self, edge: &AppRoleAssignmentEdge)
    -> ProviderResult<()>;
}

/// Convenience bound for backends that implement both surfaces.
pub trait CloudProvider: ResourceApi + ApplicationApi {}

impl<T: ResourceApi + ApplicationApi> CloudProvider for T {}
