//! Idempotent resource reconciliation.
//!
//! A [`ResourceSpec`] names one resource by a natural key that is stable
//! across runs. [`Reconciler::ensure`] probes for it and creates it only when
//! absent, so re-running the whole provisioning sequence never duplicates a
//! resource and never overwrites attributes it was not asked to change.

mod membership;
mod roles;

use std::{collections::BTreeMap, fmt, sync::Arc};

pub use membership::{MembershipManager, MembershipOutcome};
pub use roles::{GrantPrincipal, RoleAssignmentGranter};
use serde::{Deserialize, Serialize};

use crate::provider::{ProviderError, ResourceApi, ResourceRef};

/// The fixed set of resource kinds this tool manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ResourceGroup,
    ManagedIdentity,
    SecurityGroup,
    Application,
    ServicePrincipal,
    RoleAssignment,
    FederatedCredential,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ResourceGroup => "resource_group",
            ResourceKind::ManagedIdentity => "managed_identity",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::Application => "application",
            ResourceKind::ServicePrincipal => "service_principal",
            ResourceKind::RoleAssignment => "role_assignment",
            ResourceKind::FederatedCredential => "federated_credential",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type of principal a role assignment targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PrincipalType {
    #[default]
    ServicePrincipal,
    Group,
    User,
}

impl PrincipalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalType::ServicePrincipal => "ServicePrincipal",
            PrincipalType::Group => "Group",
            PrincipalType::User => "User",
        }
    }
}

/// Desired attributes, one variant per resource kind.
///
/// Each variant carries only the fields that kind accepts; the kind of a
/// spec is derived from its variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DesiredAttributes {
    ResourceGroup {
        location: String,
        #[serde(default)]
        tags: BTreeMap<String, String>,
    },
    ManagedIdentity {
        resource_group: String,
        location: String,
        #[serde(default)]
        tags: BTreeMap<String, String>,
    },
    SecurityGroup {
        mail_nickname: String,
        #[serde(default)]
        description: Option<String>,
    },
    Application {
        sign_in_audience: String,
    },
    ServicePrincipal {
        app_id: String,
    },
    RoleAssignment {
        principal_id: String,
        principal_type: PrincipalType,
        scope: String,
        role_name: String,
    },
    FederatedCredential {
        resource_group: String,
        identity_name: String,
        issuer: String,
        subject: String,
        audiences: Vec<String>,
    },
}

impl DesiredAttributes {
    pub fn kind(&self) -> ResourceKind {
        match self {
            DesiredAttributes::ResourceGroup { .. } => ResourceKind::ResourceGroup,
            DesiredAttributes::ManagedIdentity { .. } => ResourceKind::ManagedIdentity,
            DesiredAttributes::SecurityGroup { .. } => ResourceKind::SecurityGroup,
            DesiredAttributes::Application { .. } => ResourceKind::Application,
            DesiredAttributes::ServicePrincipal { .. } => ResourceKind::ServicePrincipal,
            DesiredAttributes::RoleAssignment { .. } => ResourceKind::RoleAssignment,
            DesiredAttributes::FederatedCredential { .. } => ResourceKind::FederatedCredential,
        }
    }
}

/// A named resource and the attributes it must be created with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Sole idempotency discriminant within kind and scope.
    pub natural_key: String,
    pub desired: DesiredAttributes,
}

impl ResourceSpec {
    pub fn new(natural_key: impl Into<String>, desired: DesiredAttributes) -> Self {
        Self {
            natural_key: natural_key.into(),
            desired,
        }
    }

    pub fn resource_group(name: impl Into<String>, location: impl Into<String>) -> Self {
        Self::new(
            name,
            DesiredAttributes::ResourceGroup {
                location: location.into(),
                tags: BTreeMap::new(),
            },
        )
    }

    pub fn managed_identity(
        name: impl Into<String>,
        resource_group: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        Self::new(
            name,
            DesiredAttributes::ManagedIdentity {
                resource_group: resource_group.into(),
                location: location.into(),
                tags: BTreeMap::new(),
            },
        )
    }

    pub fn security_group(display_name: impl Into<String>, description: Option<String>) -> Self {
        let display_name = display_name.into();
        let mail_nickname = mail_nickname_for(&display_name);
        Self::new(
            display_name,
            DesiredAttributes::SecurityGroup {
                mail_nickname,
                description,
            },
        )
    }

    /// A role assignment keyed by `(principal, scope, role)`.
    pub fn role_assignment(
        principal_id: impl Into<String>,
        principal_type: PrincipalType,
        scope: impl Into<String>,
        role_name: impl Into<String>,
    ) -> Self {
        let principal_id = principal_id.into();
        let scope = scope.into();
        let role_name = role_name.into();
        Self::new(
            format!("{principal_id}|{}|{role_name}", scope.to_lowercase()),
            DesiredAttributes::RoleAssignment {
                principal_id,
                principal_type,
                scope,
                role_name,
            },
        )
    }

    pub fn kind(&self) -> ResourceKind {
        self.desired.kind()
    }

    /// Reject specs that cannot be dispatched: empty key or missing
    /// attributes required by the kind.
    pub fn validate(&self) -> Result<(), String> {
        if self.natural_key.trim().is_empty() {
            return Err(format!("{} natural key must not be empty", self.kind()));
        }

        fn require(field: &str, value: &str) -> Result<(), String> {
            if value.trim().is_empty() {
                Err(format!("'{field}' is required"))
            } else {
                Ok(())
            }
        }

        match &self.desired {
            DesiredAttributes::ResourceGroup { location, .. } => require("location", location),
            DesiredAttributes::ManagedIdentity {
                resource_group,
                location,
                ..
            } => {
                require("resource_group", resource_group)?;
                require("location", location)
            }
            DesiredAttributes::SecurityGroup { mail_nickname, .. } => {
                require("mail_nickname", mail_nickname)
            }
            DesiredAttributes::Application { sign_in_audience } => {
                require("sign_in_audience", sign_in_audience)
            }
            DesiredAttributes::ServicePrincipal { app_id } => require("app_id", app_id),
            DesiredAttributes::RoleAssignment {
                principal_id,
                scope,
                role_name,
                ..
            } => {
                require("principal_id", principal_id)?;
                require("scope", scope)?;
                require("role_name", role_name)
            }
            DesiredAttributes::FederatedCredential {
                resource_group,
                identity_name,
                issuer,
                subject,
                audiences,
            } => {
                require("resource_group", resource_group)?;
                require("identity_name", identity_name)?;
                require("issuer", issuer)?;
                require("subject", subject)?;
                if audiences.is_empty() {
                    return Err("'audiences' must not be empty".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Derive a mail nickname from a group display name (alphanumerics only).
pub fn mail_nickname_for(display_name: &str) -> String {
    display_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}

/// Result status of one reconcile call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Created,
    AlreadyExists,
    Updated,
    Failed,
}

impl OutcomeStatus {
    pub fn is_success(&self) -> bool {
        !matches!(self, OutcomeStatus::Failed)
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutcomeStatus::Created => write!(f, "created"),
            OutcomeStatus::AlreadyExists => write!(f, "already_exists"),
            OutcomeStatus::Updated => write!(f, "updated"),
            OutcomeStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of a single reconcile call. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationOutcome {
    pub kind: ResourceKind,
    pub natural_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_detail: Option<String>,
}

impl ReconciliationOutcome {
    pub fn created(spec: &ResourceSpec, resource: ResourceRef) -> Self {
        Self::with_status(spec, Some(resource), OutcomeStatus::Created, None)
    }

    pub fn already_exists(spec: &ResourceSpec, resource: ResourceRef) -> Self {
        Self::with_status(spec, Some(resource), OutcomeStatus::AlreadyExists, None)
    }

    pub fn failed(spec: &ResourceSpec, detail: impl Into<String>) -> Self {
        Self::with_status(spec, None, OutcomeStatus::Failed, Some(detail.into()))
    }

    pub(crate) fn with_status(
        spec: &ResourceSpec,
        resource: Option<ResourceRef>,
        status: OutcomeStatus,
        failure_detail: Option<String>,
    ) -> Self {
        Self {
            kind: spec.kind(),
            natural_key: spec.natural_key.clone(),
            resource,
            status,
            failure_detail,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn was_created(&self) -> bool {
        self.status == OutcomeStatus::Created
    }
}

/// Ensures resources exist, using an explicit provider handle.
#[derive(Clone)]
pub struct Reconciler {
    provider: Arc<dyn ResourceApi>,
}

impl Reconciler {
    pub fn new(provider: Arc<dyn ResourceApi>) -> Self {
        Self { provider }
    }

    /// Make sure the resource described by `spec` exists.
    ///
    /// Existing resources are returned as-is; attributes are never synced.
    /// A create conflict triggers one re-probe before giving up.
    pub async fn ensure(&self, spec: &ResourceSpec) -> ReconciliationOutcome {
        let kind = spec.kind();

        if let Err(reason) = spec.validate() {
            tracing::warn!(kind = %kind, key = %spec.natural_key, %reason, "Invalid resource spec");
            return ReconciliationOutcome::failed(spec, format!("invalid spec: {reason}"));
        }

        match self.provider.probe(spec).await {
            Ok(Some(existing)) => {
                tracing::debug!(kind = %kind, key = %spec.natural_key, id = %existing.id, "Resource already exists");
                return ReconciliationOutcome::already_exists(spec, existing);
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(kind = %kind, key = %spec.natural_key, error = %e, "Resource probe failed");
                return ReconciliationOutcome::failed(spec, format!("probe failed: {e}"));
            }
        }

        match self.provider.create(spec).await {
            Ok(created) => {
                tracing::info!(kind = %kind, key = %spec.natural_key, id = %created.id, "Resource created");
                ReconciliationOutcome::created(spec, created)
            }
            Err(ProviderError::Conflict(detail)) => self.resolve_conflict(spec, &detail).await,
            Err(e) => {
                tracing::warn!(kind = %kind, key = %spec.natural_key, error = %e, "Resource creation failed");
                ReconciliationOutcome::failed(spec, format!("create failed: {e}"))
            }
        }
    }

    /// The resource appeared between probe and create: re-probe once.
    async fn resolve_conflict(&self, spec: &ResourceSpec, detail: &str) -> ReconciliationOutcome {
        tracing::debug!(kind = %spec.kind(), key = %spec.natural_key, %detail, "Create conflict, re-probing");
        match self.provider.probe(spec).await {
            Ok(Some(existing)) => ReconciliationOutcome::already_exists(spec, existing),
            Ok(None) => ReconciliationOutcome::failed(
                spec,
                format!("create reported a conflict ({detail}) but the resource is not visible"),
            ),
            Err(e) => ReconciliationOutcome::failed(
                spec,
                format!("create reported a conflict ({detail}) and re-probe failed: {e}"),
            ),
        }
    }
}
