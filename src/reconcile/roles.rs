use std::sync::Arc;

use dashmap::DashSet;

use super::{OutcomeStatus, PrincipalType, ReconciliationOutcome, ResourceSpec};
use crate::{
    config::SettlePoint,
    provider::{ProviderError, ResourceApi},
    settle::Settler,
};

/// The principal receiving a role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantPrincipal {
    pub id: String,
    pub principal_type: PrincipalType,
    /// Created during this run, so possibly not yet visible to authorization.
    pub created_this_run: bool,
}

impl GrantPrincipal {
    pub fn service_principal(id: impl Into<String>, created_this_run: bool) -> Self {
        Self {
            id: id.into(),
            principal_type: PrincipalType::ServicePrincipal,
            created_this_run,
        }
    }
}

/// Ensures a principal holds a named role at a scope.
pub struct RoleAssignmentGranter {
    provider: Arc<dyn ResourceApi>,
    settler: Settler,
    settled: DashSet<String>,
}

impl RoleAssignmentGranter {
    pub fn new(provider: Arc<dyn ResourceApi>, settler: Settler) -> Self {
        Self {
            provider,
            settler,
            settled: DashSet::new(),
        }
    }

    /// Grant `role_name` at `scope`. Calling twice with the same triple
    /// creates nothing the second time and is not an error.
    ///
    /// A principal created in this run is settled once, before its first
    /// grant.
    pub async fn grant_role(
        &self,
        principal: &GrantPrincipal,
        scope: &str,
        role_name: &str,
    ) -> ReconciliationOutcome {
        let spec =
            ResourceSpec::role_assignment(&principal.id, principal.principal_type, scope, role_name);

        if let Err(reason) = spec.validate() {
            return ReconciliationOutcome::failed(&spec, format!("invalid spec: {reason}"));
        }

        if principal.created_this_run && self.settled.insert(principal.id.clone()) {
            let provider = self.provider.clone();
            let id = principal.id.clone();
            self.settler
                .wait(SettlePoint::Principal, &principal.id, || {
                    let provider = provider.clone();
                    let id = id.clone();
                    async move { provider.principal_visible(&id).await }
                })
                .await;
        }

        match self.provider.find_role_definition(scope, role_name).await {
            Ok(Some(definition_id)) => {
                tracing::debug!(role = role_name, %definition_id, "Resolved role definition");
            }
            Ok(None) => {
                tracing::warn!(role = role_name, scope, "Role definition not found");
                return ReconciliationOutcome::failed(
                    &spec,
                    format!("role definition '{role_name}' not found at {scope}"),
                );
            }
            Err(e) => {
                return ReconciliationOutcome::failed(
                    &spec,
                    format!("role definition lookup failed: {e}"),
                );
            }
        }

        match self.provider.probe(&spec).await {
            Ok(Some(existing)) => {
                tracing::debug!(principal = %principal.id, role = role_name, scope, "Role already assigned");
                return ReconciliationOutcome::already_exists(&spec, existing);
            }
            Ok(None) => {}
            Err(e) => {
                return ReconciliationOutcome::failed(&spec, format!("probe failed: {e}"));
            }
        }

        match self.provider.create(&spec).await {
            Ok(created) => {
                tracing::info!(principal = %principal.id, role = role_name, scope, "Role assigned");
                ReconciliationOutcome::created(&spec, created)
            }
            Err(ProviderError::Conflict(detail)) => {
                tracing::debug!(principal = %principal.id, role = role_name, %detail, "Role assignment already exists");
                // A conflict means the grant exists; the lookup only supplies its id.
                let existing = match self.provider.probe(&spec).await {
                    Ok(existing) => existing,
                    Err(e) => {
                        tracing::debug!(principal = %principal.id, role = role_name, error = %e, "Existing role assignment lookup failed");
                        None
                    }
                };
                ReconciliationOutcome::with_status(
                    &spec,
                    existing,
                    OutcomeStatus::AlreadyExists,
                    None,
                )
            }
            Err(e) => {
                tracing::warn!(principal = %principal.id, role = role_name, scope, error = %e, "Role assignment failed");
                ReconciliationOutcome::failed(&spec, format!("create failed: {e}"))
            }
        }
    }
}
