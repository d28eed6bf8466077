//! The full provisioning sequence.
//!
//! Order: session check, resource group, managed identity, role grants,
//! security groups, memberships, federated credentials, SAML application,
//! signing certificate, outputs. Each step is awaited before the next.
//! Only a failed session check and a failure to locate the SAML application
//! abort the run; everything else is recorded in the report and the run
//! continues so a re-run can pick up where this one left off.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

#[cfg(feature = "cert-inspect")]
use crate::federation::inspect;
use crate::{
    config::ProvisionConfig,
    federation::{CertificateDetails, CertificatePayload, MetadataCertificateExtractor},
    output::{DeploymentOutputs, RunFacts},
    provider::{
        ApplicationApi, CloudProvider, GroupMembershipEdge, MemberKind, ProviderError,
        ResourceApi, SessionInfo,
    },
    reconcile::{
        DesiredAttributes, GrantPrincipal, MembershipManager, MembershipOutcome, Reconciler,
        ReconciliationOutcome, ResourceSpec, RoleAssignmentGranter,
    },
    saml::{ManagedGroup, SamlAppConfigurator, SamlConfiguration, SamlError},
    settle::Settler,
};

/// Failures that stop the run.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("Precondition failed: {0}. Run `az login` and check the subscription id")]
    Precondition(#[source] ProviderError),

    #[error(transparent)]
    Saml(#[from] SamlError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
    Extracted,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct CertificateReport {
    pub status: CertificateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<CertificateDetails>,
}

/// Everything a run did, in order.
#[derive(Debug, Clone, Serialize)]
pub struct ProvisioningReport {
    pub session: SessionInfo,
    pub resources: Vec<ReconciliationOutcome>,
    pub memberships: Vec<MembershipOutcome>,
    pub saml: SamlConfiguration,
    pub certificate: CertificateReport,
    pub warnings: Vec<String>,
    pub outputs: DeploymentOutputs,
}

impl ProvisioningReport {
    /// Number of failed resources, memberships, SAML steps and certificate
    /// extraction.
    pub fn failure_count(&self) -> usize {
        self.resources.iter().filter(|r| !r.is_success()).count()
            + self.memberships.iter().filter(|m| !m.is_success()).count()
            + self.saml.failed_steps().count()
            + usize::from(self.certificate.status == CertificateStatus::Failed)
    }

    pub fn is_clean(&self) -> bool {
        self.failure_count() == 0 && self.warnings.is_empty()
    }

    /// Human-readable summary.
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Subscription {} ({})\n",
            self.session.subscription_id,
            self.session.subscription_name.as_deref().unwrap_or("unnamed")
        ));

        out.push_str("\nResources:\n");
        for r in &self.resources {
            out.push_str(&format!("  [{}] {} {}", r.status, r.kind, r.natural_key));
            if let Some(detail) = &r.failure_detail {
                out.push_str(&format!(": {detail}"));
            }
            out.push('\n');
        }

        if !self.memberships.is_empty() {
            out.push_str("\nMemberships:\n");
            for m in &self.memberships {
                out.push_str(&format!(
                    "  [{}] {} {} -> {}",
                    m.status, m.member_kind, m.member_id, m.group_id
                ));
                if let Some(detail) = &m.failure_detail {
                    out.push_str(&format!(": {detail}"));
                }
                out.push('\n');
            }
        }

        out.push_str(&format!(
            "\nSAML application {} (client id {}):\n",
            self.saml.application.display_name,
            self.saml.client_id()
        ));
        for step in &self.saml.steps {
            out.push_str(&format!("  [{:?}] {}", step.status, step.step));
            if let Some(detail) = &step.detail {
                out.push_str(&format!(": {detail}"));
            }
            out.push('\n');
            if let Some(remediation) = &step.remediation {
                out.push_str(&format!("      manual fix: {remediation}\n"));
            }
        }

        out.push_str(&format!("\nSigning certificate: {:?}", self.certificate.status));
        if let Some(detail) = &self.certificate.detail {
            out.push_str(&format!(" ({detail})"));
        }
        out.push('\n');
        if let Some(details) = &self.certificate.details {
            out.push_str(&format!(
                "  subject {}, thumbprint {}, expires {}\n",
                details.subject, details.thumbprint_sha1, details.not_after
            ));
        }
        if let Some(remediation) = &self.certificate.remediation {
            out.push_str(&format!("  manual fix: {remediation}\n"));
        }

        if !self.warnings.is_empty() {
            out.push_str("\nWarnings:\n");
            for warning in &self.warnings {
                out.push_str(&format!("  - {warning}\n"));
            }
        }
        if !self.outputs.missing.is_empty() {
            out.push_str(&format!(
                "\nOutputs not determined (set by hand): {}\n",
                self.outputs.missing.join(", ")
            ));
        }
        out
    }
}

/// Runs the provisioning sequence against one provider.
pub struct Provisioner {
    config: ProvisionConfig,
    resources: Arc<dyn ResourceApi>,
    applications: Arc<dyn ApplicationApi>,
    extractor: Option<MetadataCertificateExtractor>,
    settler: Settler,
}

impl Provisioner {
    /// `extractor` is `None` when the certificate should not be fetched
    /// (dry runs).
    pub fn new<P>(
        config: ProvisionConfig,
        provider: Arc<P>,
        extractor: Option<MetadataCertificateExtractor>,
    ) -> Self
    where
        P: CloudProvider + 'static,
    {
        let settler = Settler::new(config.settle.clone());
        Self {
            config,
            resources: provider.clone(),
            applications: provider,
            extractor,
            settler,
        }
    }

    /// Replace the settle policy taken from configuration.
    pub fn with_settler(mut self, settler: Settler) -> Self {
        self.settler = settler;
        self
    }

    pub async fn run(&self) -> Result<ProvisioningReport, ProvisionError> {
        let mut warnings = Vec::new();
        let session = self.check_session(&mut warnings).await?;

        let reconciler = Reconciler::new(self.resources.clone());
        let granter = RoleAssignmentGranter::new(self.resources.clone(), self.settler.clone());
        let members = MembershipManager::new(self.resources.clone());
        let cfg = &self.config;
        let mut resources = Vec::new();

        let rg = reconciler
            .ensure(&ResourceSpec::new(
                cfg.resources.resource_group.clone(),
                DesiredAttributes::ResourceGroup {
                    location: cfg.azure.location.clone(),
                    tags: cfg.resources.tags.clone(),
                },
            ))
            .await;
        resources.push(rg);

        let identity = reconciler
            .ensure(&ResourceSpec::new(
                cfg.resources.managed_identity.clone(),
                DesiredAttributes::ManagedIdentity {
                    resource_group: cfg.resources.resource_group.clone(),
                    location: cfg.azure.location.clone(),
                    tags: cfg.resources.tags.clone(),
                },
            ))
            .await;
        let identity_created = identity.was_created();
        let identity_ref = identity.resource.clone();
        resources.push(identity);

        match identity_ref.as_ref().and_then(|r| r.principal_id.clone()) {
            Some(principal_id) => {
                let principal = GrantPrincipal::service_principal(principal_id, identity_created);
                for assignment in &cfg.resources.role_assignments {
                    let scope = cfg.resolve_scope(&assignment.scope);
                    resources.push(granter.grant_role(&principal, &scope, &assignment.role).await);
                }
            }
            None if !cfg.resources.role_assignments.is_empty() => {
                warnings.push(format!(
                    "Skipped {} role assignment(s): managed identity '{}' has no principal id",
                    cfg.resources.role_assignments.len(),
                    cfg.resources.managed_identity
                ));
            }
            None => {}
        }

        let mut groups = Vec::new();
        let mut memberships = Vec::new();
        for (slot, group) in cfg.resources.groups.iter() {
            let outcome = reconciler
                .ensure(&ResourceSpec::security_group(
                    group.display_name.clone(),
                    group.description.clone(),
                ))
                .await;
            let object_id = outcome.resource.as_ref().map(|r| r.id.clone());
            tracing::debug!(slot, group = %group.display_name, status = %outcome.status, "Security group");
            resources.push(outcome);

            if let Some(group_id) = &object_id {
                for member_id in &group.members {
                    let edge = GroupMembershipEdge {
                        group_id: group_id.clone(),
                        member_id: member_id.clone(),
                        member_kind: MemberKind::User,
                    };
                    memberships.push(members.ensure_member(&edge).await);
                }
            } else if !group.members.is_empty() {
                warnings.push(format!(
                    "Skipped {} member(s) of '{}': group is unavailable",
                    group.members.len(),
                    group.display_name
                ));
            }

            groups.push(ManagedGroup {
                display_name: group.display_name.clone(),
                object_id,
            });
        }

        for credential in &cfg.resources.federated_credentials {
            let outcome = reconciler
                .ensure(&ResourceSpec::new(
                    credential.name.clone(),
                    DesiredAttributes::FederatedCredential {
                        resource_group: cfg.resources.resource_group.clone(),
                        identity_name: cfg.resources.managed_identity.clone(),
                        issuer: credential.issuer.clone(),
                        subject: credential.subject.clone(),
                        audiences: credential.audiences.clone(),
                    },
                ))
                .await;
            resources.push(outcome);
        }

        let configurator = SamlAppConfigurator::new(
            self.applications.clone(),
            self.settler.clone(),
            cfg.saml.clone(),
        );
        let saml = configurator.configure(&groups).await?;

        let (certificate, payload) = self
            .extract_certificate(saml.client_id(), &mut warnings)
            .await;

        let facts = RunFacts {
            identity_client_id: identity_ref.and_then(|r| r.client_id),
            admin_group_id: groups.first().and_then(|g| g.object_id.clone()),
            saml_client_id: Some(saml.client_id().to_string()),
            certificate: payload,
        };
        let outputs = DeploymentOutputs::assemble(cfg, &facts);

        let report = ProvisioningReport {
            session,
            resources,
            memberships,
            saml,
            certificate,
            warnings,
            outputs,
        };
        tracing::info!(
            resources = report.resources.len(),
            failures = report.failure_count(),
            warnings = report.warnings.len(),
            "Provisioning run complete"
        );
        Ok(report)
    }

    async fn check_session(&self, warnings: &mut Vec<String>) -> Result<SessionInfo, ProvisionError> {
        let session = self
            .resources
            .check_session()
            .await
            .map_err(ProvisionError::Precondition)?;

        tracing::info!(
            subscription_id = %session.subscription_id,
            subscription = session.subscription_name.as_deref().unwrap_or(""),
            "Session verified"
        );

        if let Some(tenant) = &session.tenant_id
            && !tenant.eq_ignore_ascii_case(&self.config.azure.tenant_id)
        {
            let warning = format!(
                "Subscription belongs to tenant {tenant}, configuration names tenant {}",
                self.config.azure.tenant_id
            );
            tracing::warn!(%warning, "Tenant mismatch");
            warnings.push(warning);
        }
        Ok(session)
    }

    async fn extract_certificate(
        &self,
        client_id: &str,
        warnings: &mut Vec<String>,
    ) -> (CertificateReport, Option<CertificatePayload>) {
        let Some(extractor) = &self.extractor else {
            return (
                CertificateReport {
                    status: CertificateStatus::Skipped,
                    detail: Some("federation metadata not fetched".into()),
                    remediation: None,
                    details: None,
                },
                None,
            );
        };

        match extractor
            .extract_certificate(&self.config.azure.tenant_id, client_id)
            .await
        {
            Ok(payload) => {
                let details = inspect_certificate(&payload, warnings);
                let report = CertificateReport {
                    status: CertificateStatus::Extracted,
                    detail: None,
                    remediation: None,
                    details,
                };
                (report, Some(payload))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Signing certificate extraction failed");
                let report = CertificateReport {
                    status: CertificateStatus::Failed,
                    detail: Some(e.to_string()),
                    remediation: Some(e.remediation().to_string()),
                    details: None,
                };
                (report, None)
            }
        }
    }
}

#[cfg(feature = "cert-inspect")]
fn inspect_certificate(
    payload: &CertificatePayload,
    warnings: &mut Vec<String>,
) -> Option<CertificateDetails> {
    match inspect(payload) {
        Ok(details) => {
            tracing::info!(
                subject = %details.subject,
                thumbprint = %details.thumbprint_sha1,
                not_after = %details.not_after,
                "Signing certificate"
            );
            if details.expired {
                tracing::warn!(not_after = %details.not_after, "Signing certificate has expired");
                warnings.push(format!("Signing certificate expired on {}", details.not_after));
            }
            Some(details)
        }
        Err(reason) => {
            tracing::warn!(%reason, "Could not decode signing certificate");
            warnings.push(format!("Could not decode signing certificate: {reason}"));
            None
        }
    }
}

#[cfg(not(feature = "cert-inspect"))]
fn inspect_certificate(
    _payload: &CertificatePayload,
    _warnings: &mut Vec<String>,
) -> Option<CertificateDetails> {
    None
}
