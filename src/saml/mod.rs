//! SAML single sign-on configuration of the OpenCTI application.
//!
//! [`SamlAppConfigurator::configure`] observes the application and service
//! principal as they are and moves them to the target configuration. It can
//! start from any state: a fresh tenant, a half-configured application left
//! by an interrupted run, or a fully configured one (where it changes
//! nothing but the groups claim). Only locating or creating the pair is
//! fatal; every later step records a warning with a manual remediation and
//! the run continues.

mod state;

use std::{fmt, sync::Arc};

use serde::Serialize;
pub use state::{GroupsClaimMode, SamlApplicationState, identifier_uri_for};
use thiserror::Error;

use crate::{
    config::{SamlConfig, SettlePoint},
    provider::{
        AppRoleAssignmentEdge, Application, ApplicationApi, ApplicationPatch, ProviderError,
        ServicePrincipal, ServicePrincipalPatch,
    },
    settle::Settler,
};

/// Role id Entra ID uses for "Default Access" when an app declares no roles.
pub const DEFAULT_ACCESS_ROLE_ID: &str = "00000000-0000-0000-0000-000000000000";

const USER_ROLE: &str = "User";
const GROUPS_CLAIM: &str = "ApplicationGroup";
const SSO_MODE: &str = "saml";

/// The eight configuration steps, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SamlStep {
    LocateApplication,
    IdentifierUri,
    RedirectUris,
    GroupsClaim,
    SingleSignOnMode,
    SigningCertificate,
    Notification,
    GroupAssignment,
}

impl SamlStep {
    pub fn number(&self) -> u8 {
        match self {
            SamlStep::LocateApplication => 1,
            SamlStep::IdentifierUri => 2,
            SamlStep::RedirectUris => 3,
            SamlStep::GroupsClaim => 4,
            SamlStep::SingleSignOnMode => 5,
            SamlStep::SigningCertificate => 6,
            SamlStep::Notification => 7,
            SamlStep::GroupAssignment => 8,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SamlStep::LocateApplication => "locate_application",
            SamlStep::IdentifierUri => "identifier_uri",
            SamlStep::RedirectUris => "redirect_uris",
            SamlStep::GroupsClaim => "groups_claim",
            SamlStep::SingleSignOnMode => "sso_mode",
            SamlStep::SigningCertificate => "signing_certificate",
            SamlStep::Notification => "notification",
            SamlStep::GroupAssignment => "group_assignment",
        }
    }
}

impl fmt::Display for SamlStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}. {}", self.number(), self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// The step changed something.
    Applied,
    /// Already in the target state.
    Unchanged,
    /// Nothing to do with the given inputs.
    Skipped,
    Failed,
}

/// Result of one configuration step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: SamlStep,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// What to do by hand when the step failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

impl StepReport {
    fn new(step: SamlStep, status: StepStatus) -> Self {
        Self {
            step,
            status,
            detail: None,
            remediation: None,
        }
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn failed(step: SamlStep, error: &ProviderError, remediation: impl Into<String>) -> Self {
        tracing::warn!(step = %step, error = %error, "SAML configuration step failed, continuing");
        Self {
            step,
            status: StepStatus::Failed,
            detail: Some(error.to_string()),
            remediation: Some(remediation.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// A managed security group to assign to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedGroup {
    pub display_name: String,
    /// `None` when the group could not be ensured earlier in the run.
    pub object_id: Option<String>,
}

#[derive(Debug, Error)]
pub enum SamlError {
    #[error("Failed to locate or create application '{name}': {source}")]
    Locate {
        name: String,
        #[source]
        source: ProviderError,
    },
}

/// Final state of the pair plus what each step did.
#[derive(Debug, Clone, Serialize)]
pub struct SamlConfiguration {
    pub application: Application,
    pub service_principal: ServicePrincipal,
    /// The pair was instantiated in this run.
    pub created: bool,
    /// State observed right after step 1.
    pub observed: SamlApplicationState,
    pub steps: Vec<StepReport>,
}

impl SamlConfiguration {
    pub fn client_id(&self) -> &str {
        &self.application.app_id
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepReport> {
        self.steps.iter().filter(|s| s.is_failed())
    }
}

/// Drives an application / service principal pair to the SAML target state.
pub struct SamlAppConfigurator {
    provider: Arc<dyn ApplicationApi>,
    settler: Settler,
    config: SamlConfig,
}

impl SamlAppConfigurator {
    pub fn new(provider: Arc<dyn ApplicationApi>, settler: Settler, config: SamlConfig) -> Self {
        Self {
            provider,
            settler,
            config,
        }
    }

    pub async fn configure(&self, groups: &[ManagedGroup]) -> Result<SamlConfiguration, SamlError> {
        let (mut app, mut sp, created, locate) = self.locate_or_create().await?;
        let observed = SamlApplicationState::observe(&app, &sp, &self.config.callback_url);
        tracing::info!(
            app_id = %app.app_id,
            created,
            identifier_uri_set = observed.identifier_uri_set,
            redirect_configured = observed.redirect_configured,
            groups_claim = %observed.groups_claim_mode,
            signing_cert_present = observed.signing_cert_present,
            sso_mode_is_saml = observed.sso_mode_is_saml,
            "Observed SAML application state"
        );

        let mut steps = vec![locate];
        steps.push(self.ensure_identifier_uri(&mut app, &observed).await);
        steps.push(self.ensure_redirect(&mut app, &observed).await);
        steps.push(self.ensure_groups_claim(&mut app, &observed).await);
        steps.push(self.ensure_sso_mode(&mut sp, &observed).await);
        steps.push(self.ensure_signing_certificate(&mut sp, &observed).await);
        steps.push(self.ensure_notification(&mut sp).await);
        steps.extend(self.ensure_group_assignments(&app, &sp, groups).await);

        Ok(SamlConfiguration {
            application: app,
            service_principal: sp,
            created,
            observed,
            steps,
        })
    }

    /// Step 1.
    async fn locate_or_create(
        &self,
    ) -> Result<(Application, ServicePrincipal, bool, StepReport), SamlError> {
        let name = self.config.app_display_name.as_str();
        let fatal = |source| SamlError::Locate {
            name: name.to_string(),
            source,
        };

        let Some(app) = self.provider.find_application(name).await.map_err(fatal)? else {
            let (app, sp) = self
                .provider
                .instantiate_template(&self.config.template_id, name)
                .await
                .map_err(fatal)?;
            tracing::info!(app_id = %app.app_id, sp_id = %sp.id, "Instantiated SAML application template");

            let provider = self.provider.clone();
            let app_id = app.app_id.clone();
            self.settler
                .wait(SettlePoint::Template, name, || {
                    let provider = provider.clone();
                    let app_id = app_id.clone();
                    async move {
                        provider
                            .find_service_principal(&app_id)
                            .await
                            .map(|sp| sp.is_some())
                    }
                })
                .await;

            let report = StepReport::new(SamlStep::LocateApplication, StepStatus::Applied)
                .with_detail(format!("instantiated template {}", self.config.template_id));
            return Ok((app, sp, true, report));
        };

        if let Some(sp) = self
            .provider
            .find_service_principal(&app.app_id)
            .await
            .map_err(fatal)?
        {
            let report = StepReport::new(SamlStep::LocateApplication, StepStatus::Unchanged);
            return Ok((app, sp, false, report));
        }

        tracing::info!(app_id = %app.app_id, "Application has no service principal, creating one");
        let sp = match self.provider.create_service_principal(&app.app_id).await {
            Ok(sp) => sp,
            Err(ProviderError::Conflict(_)) => self
                .provider
                .find_service_principal(&app.app_id)
                .await
                .map_err(fatal)?
                .ok_or_else(|| {
                    fatal(ProviderError::NotFound(format!(
                        "service principal for {} reported as existing but not visible",
                        app.app_id
                    )))
                })?,
            Err(e) => return Err(fatal(e)),
        };
        let report = StepReport::new(SamlStep::LocateApplication, StepStatus::Applied)
            .with_detail("created missing service principal");
        Ok((app, sp, false, report))
    }

    /// Step 2.
    async fn ensure_identifier_uri(
        &self,
        app: &mut Application,
        observed: &SamlApplicationState,
    ) -> StepReport {
        let step = SamlStep::IdentifierUri;
        if observed.identifier_uri_set {
            return StepReport::new(step, StepStatus::Unchanged);
        }

        let uri = identifier_uri_for(&app.app_id);
        let patch = ApplicationPatch {
            identifier_uris: Some(vec![uri.clone()]),
            ..Default::default()
        };
        match self.provider.update_application(&app.object_id, &patch).await {
            Ok(()) => {
                app.identifier_uris = vec![uri.clone()];
                StepReport::new(step, StepStatus::Applied).with_detail(uri)
            }
            Err(e) => StepReport::failed(
                step,
                &e,
                format!("Set Identifier (Entity ID) to {uri} in the application's Single sign-on blade"),
            ),
        }
    }

    /// Step 3.
    async fn ensure_redirect(
        &self,
        app: &mut Application,
        observed: &SamlApplicationState,
    ) -> StepReport {
        let step = SamlStep::RedirectUris;
        if observed.redirect_configured {
            return StepReport::new(step, StepStatus::Unchanged);
        }

        let callback = self.config.callback_url.clone();
        let patch = ApplicationPatch {
            redirect_uris: Some(vec![callback.clone()]),
            logout_url: Some(callback.clone()),
            ..Default::default()
        };
        match self.provider.update_application(&app.object_id, &patch).await {
            Ok(()) => {
                app.redirect_uris = vec![callback.clone()];
                app.logout_url = Some(callback.clone());
                StepReport::new(step, StepStatus::Applied).with_detail(callback)
            }
            Err(e) => StepReport::failed(
                step,
                &e,
                format!("Set Reply URL and Logout URL to {callback} in the Single sign-on blade"),
            ),
        }
    }

    /// Step 4. Written on every run.
    async fn ensure_groups_claim(
        &self,
        app: &mut Application,
        observed: &SamlApplicationState,
    ) -> StepReport {
        let step = SamlStep::GroupsClaim;
        let patch = ApplicationPatch {
            group_membership_claims: Some(GROUPS_CLAIM.to_string()),
            ..Default::default()
        };
        match self.provider.update_application(&app.object_id, &patch).await {
            Ok(()) => {
                app.group_membership_claims = Some(GROUPS_CLAIM.to_string());
                let status = if observed.groups_claim_mode == GroupsClaimMode::ApplicationGroup {
                    StepStatus::Unchanged
                } else {
                    StepStatus::Applied
                };
                StepReport::new(step, status)
                    .with_detail(format!("{} -> {GROUPS_CLAIM}", observed.groups_claim_mode))
            }
            Err(e) => StepReport::failed(
                step,
                &e,
                "Add a groups claim for 'Groups assigned to the application' under Attributes & Claims",
            ),
        }
    }

    /// Step 5.
    async fn ensure_sso_mode(
        &self,
        sp: &mut ServicePrincipal,
        observed: &SamlApplicationState,
    ) -> StepReport {
        let step = SamlStep::SingleSignOnMode;
        if observed.sso_mode_is_saml {
            return StepReport::new(step, StepStatus::Unchanged);
        }

        let patch = ServicePrincipalPatch {
            preferred_single_sign_on_mode: Some(SSO_MODE.to_string()),
            ..Default::default()
        };
        match self.provider.update_service_principal(&sp.id, &patch).await {
            Ok(()) => {
                sp.preferred_single_sign_on_mode = Some(SSO_MODE.to_string());
                StepReport::new(step, StepStatus::Applied)
            }
            Err(e) => StepReport::failed(
                step,
                &e,
                "Select SAML as the single sign-on method in the Single sign-on blade",
            ),
        }
    }

    /// Step 6.
    async fn ensure_signing_certificate(
        &self,
        sp: &mut ServicePrincipal,
        observed: &SamlApplicationState,
    ) -> StepReport {
        let step = SamlStep::SigningCertificate;
        if observed.signing_cert_present {
            return StepReport::new(step, StepStatus::Unchanged);
        }

        let thumbprint = match &observed.unpreferred_signing_key {
            Some(existing) => {
                tracing::info!(sp_id = %sp.id, thumbprint = %existing, "Reusing attached token-signing certificate");
                existing.clone()
            }
            None => {
                let end = chrono::Utc::now()
                    + chrono::Duration::days(i64::from(self.config.certificate_validity_days));
                match self
                    .provider
                    .add_token_signing_certificate(&sp.id, &self.config.certificate_display_name, end)
                    .await
                {
                    Ok(thumbprint) => {
                        tracing::info!(sp_id = %sp.id, %thumbprint, "Added token-signing certificate");
                        sp.signing_key_thumbprints.push(thumbprint.clone());
                        thumbprint
                    }
                    Err(e) => {
                        return StepReport::failed(
                            step,
                            &e,
                            "Create a new SAML signing certificate in the Single sign-on blade and make it active",
                        );
                    }
                }
            }
        };

        if let Err(e) = self.provider.set_preferred_signing_key(&sp.id, &thumbprint).await {
            return StepReport::failed(
                step,
                &e,
                format!(
                    "Make the signing certificate with thumbprint {thumbprint} active in the Single sign-on blade"
                ),
            )
            .with_detail(format!("{e}; thumbprint {thumbprint} attached but not active"));
        }
        sp.preferred_token_signing_key_thumbprint = Some(thumbprint.clone());

        let provider = self.provider.clone();
        let app_id = sp.app_id.clone();
        self.settler
            .wait(SettlePoint::Certificate, &sp.id, || {
                let provider = provider.clone();
                let app_id = app_id.clone();
                async move {
                    provider.find_service_principal(&app_id).await.map(|sp| {
                        sp.is_some_and(|sp| sp.preferred_token_signing_key_thumbprint.is_some())
                    })
                }
            })
            .await;

        StepReport::new(step, StepStatus::Applied).with_detail(format!("thumbprint {thumbprint}"))
    }

    /// Step 7.
    async fn ensure_notification(&self, sp: &mut ServicePrincipal) -> StepReport {
        let step = SamlStep::Notification;

        let mut patch = ServicePrincipalPatch::default();
        if let Some(email) = &self.config.notification_email
            && !sp.notification_email_addresses.contains(email)
        {
            patch.notification_email_addresses = Some(vec![email.clone()]);
        }
        if let Some(login_url) = &self.config.login_url
            && sp.login_url.as_deref() != Some(login_url.as_str())
        {
            patch.login_url = Some(login_url.clone());
        }

        if patch.is_empty() {
            let configured =
                self.config.notification_email.is_some() || self.config.login_url.is_some();
            let status = if configured {
                StepStatus::Unchanged
            } else {
                StepStatus::Skipped
            };
            return StepReport::new(step, status);
        }

        match self.provider.update_service_principal(&sp.id, &patch).await {
            Ok(()) => {
                if let Some(emails) = patch.notification_email_addresses {
                    sp.notification_email_addresses = emails;
                }
                if let Some(login_url) = patch.login_url {
                    sp.login_url = Some(login_url);
                }
                StepReport::new(step, StepStatus::Applied)
            }
            Err(e) => StepReport::failed(
                step,
                &e,
                "Set the notification email and sign-on URL in the Single sign-on blade",
            ),
        }
    }

    /// Step 8. One report per group.
    async fn ensure_group_assignments(
        &self,
        app: &Application,
        sp: &ServicePrincipal,
        groups: &[ManagedGroup],
    ) -> Vec<StepReport> {
        let step = SamlStep::GroupAssignment;
        let app_role_id = user_role_id(app);

        let existing = match self.provider.list_app_role_assignments(&sp.id).await {
            Ok(existing) => existing,
            Err(e) => {
                return vec![StepReport::failed(
                    step,
                    &e,
                    "Assign the OpenCTI groups under Users and groups on the enterprise application",
                )];
            }
        };

        let mut reports = Vec::with_capacity(groups.len());
        for group in groups {
            let Some(group_id) = &group.object_id else {
                reports.push(
                    StepReport::new(step, StepStatus::Skipped)
                        .with_detail(format!("{}: group was not ensured", group.display_name)),
                );
                continue;
            };

            if existing.iter().any(|e| e.principal_id == *group_id) {
                reports.push(
                    StepReport::new(step, StepStatus::Unchanged)
                        .with_detail(group.display_name.clone()),
                );
                continue;
            }

            let edge = AppRoleAssignmentEdge {
                service_principal_id: sp.id.clone(),
                principal_id: group_id.clone(),
                app_role_id: app_role_id.clone(),
            };
            let report = match self.provider.create_app_role_assignment(&edge).await {
                Ok(()) => {
                    tracing::info!(
                        group = %group.display_name,
                        group_id = %group_id,
                        "Assigned group to application"
                    );
                    StepReport::new(step, StepStatus::Applied)
                        .with_detail(group.display_name.clone())
                }
                Err(ProviderError::Conflict(_)) => StepReport::new(step, StepStatus::Unchanged)
                    .with_detail(group.display_name.clone()),
                Err(e) => StepReport::failed(
                    step,
                    &e,
                    format!(
                        "Assign group '{}' under Users and groups on the enterprise application",
                        group.display_name
                    ),
                ),
            };
            reports.push(report);
        }
        reports
    }
}

/// Id of the application's enabled "User" role, or the default access role.
fn user_role_id(app: &Application) -> String {
    app.app_roles
        .iter()
        .filter(|role| role.is_enabled)
        .find(|role| {
            role.value.as_deref() == Some(USER_ROLE) || role.display_name.as_deref() == Some(USER_ROLE)
        })
        .map(|role| role.id.clone())
        .unwrap_or_else(|| DEFAULT_ACCESS_ROLE_ID.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{AppRole, MemoryCloud, MemoryFault, MemoryOp};

    const CALLBACK: &str = "https://opencti.example.com/auth/saml/callback";

    fn saml_config() -> SamlConfig {
        let mut config: SamlConfig =
            toml::from_str(&format!("callback_url = \"{CALLBACK}\"")).unwrap();
        config.notification_email = Some("secops@example.com".into());
        config
    }

    fn configurator(cloud: &Arc<MemoryCloud>) -> SamlAppConfigurator {
        SamlAppConfigurator::new(cloud.clone(), Settler::immediate(), saml_config())
    }

    fn groups() -> Vec<ManagedGroup> {
        ["OpenCTI-InfraAdmin", "OpenCTI-ThreatIntel", "OpenCTI-Analysts"]
            .iter()
            .enumerate()
            .map(|(i, name)| ManagedGroup {
                display_name: name.to_string(),
                object_id: Some(format!("grp-{i}")),
            })
            .collect()
    }

    fn status_of(config: &SamlConfiguration, step: SamlStep) -> StepStatus {
        config
            .steps
            .iter()
            .find(|s| s.step == step)
            .map(|s| s.status)
            .unwrap()
    }

    #[tokio::test]
    async fn test_fresh_tenant_is_fully_configured() {
        let cloud = Arc::new(MemoryCloud::new());

        let result = configurator(&cloud).configure(&groups()).await.unwrap();

        assert!(result.created);
        assert!(result.failed_steps().next().is_none());

        let app = cloud.application("OpenCTI").unwrap();
        assert_eq!(app.identifier_uris, vec![format!("api://{}", app.app_id)]);
        assert_eq!(app.redirect_uris, vec![CALLBACK.to_string()]);
        assert_eq!(app.logout_url.as_deref(), Some(CALLBACK));
        assert_eq!(app.group_membership_claims.as_deref(), Some("ApplicationGroup"));

        let sp = cloud.service_principal(&app.app_id).unwrap();
        assert_eq!(sp.preferred_single_sign_on_mode.as_deref(), Some("saml"));
        assert!(sp.preferred_token_signing_key_thumbprint.is_some());
        assert_eq!(sp.notification_email_addresses, vec!["secops@example.com".to_string()]);

        let assignments = cloud.list_app_role_assignments(&sp.id).await.unwrap();
        assert_eq!(assignments.len(), 3);
        let user_role = app
            .app_roles
            .iter()
            .find(|r| r.display_name.as_deref() == Some("User"))
            .unwrap();
        assert!(assignments.iter().all(|a| a.app_role_id == user_role.id));
    }

    #[tokio::test]
    async fn test_second_run_changes_nothing_but_groups_claim() {
        let cloud = Arc::new(MemoryCloud::new());
        configurator(&cloud).configure(&groups()).await.unwrap();

        let second = configurator(&cloud).configure(&groups()).await.unwrap();

        assert!(!second.created);
        assert!(second.observed.is_complete());
        assert!(second.steps.iter().all(|s| s.status == StepStatus::Unchanged));
        assert_eq!(cloud.op_calls(MemoryOp::InstantiateTemplate), 1);
        assert_eq!(cloud.op_calls(MemoryOp::AddTokenSigningCertificate), 1);
        assert_eq!(cloud.op_calls(MemoryOp::CreateAppRoleAssignment), 3);
    }

    #[tokio::test]
    async fn test_existing_application_without_service_principal() {
        let cloud = Arc::new(MemoryCloud::new());
        let seeded = cloud.seed_application("OpenCTI");

        let result = configurator(&cloud).configure(&groups()).await.unwrap();

        assert!(!result.created);
        assert_eq!(result.application.object_id, seeded.object_id);
        assert_eq!(status_of(&result, SamlStep::LocateApplication), StepStatus::Applied);
        assert_eq!(cloud.op_calls(MemoryOp::InstantiateTemplate), 0);
        assert_eq!(cloud.op_calls(MemoryOp::CreateServicePrincipal), 1);
    }

    #[tokio::test]
    async fn test_locate_failure_is_fatal() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.inject(
            MemoryFault::Op(MemoryOp::InstantiateTemplate),
            ProviderError::Auth("Insufficient privileges".into()),
        );

        let err = configurator(&cloud).configure(&groups()).await.unwrap_err();
        assert!(err.to_string().contains("Insufficient privileges"));
    }

    #[tokio::test]
    async fn test_later_failures_continue_with_remediation() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.inject(
            MemoryFault::Op(MemoryOp::AddTokenSigningCertificate),
            ProviderError::Api {
                status: 403,
                code: "Authorization_RequestDenied".into(),
                message: "Insufficient privileges".into(),
            },
        );

        let result = configurator(&cloud).configure(&groups()).await.unwrap();

        let failed: Vec<_> = result.failed_steps().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].step, SamlStep::SigningCertificate);
        assert!(failed[0].remediation.as_deref().unwrap().contains("signing certificate"));
        // Steps after the failure still ran.
        assert_eq!(status_of(&result, SamlStep::Notification), StepStatus::Applied);
        assert_eq!(cloud.op_calls(MemoryOp::CreateAppRoleAssignment), 3);
    }

    #[tokio::test]
    async fn test_inactive_certificate_is_reused_on_next_run() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.inject(
            MemoryFault::Op(MemoryOp::SetPreferredSigningKey),
            ProviderError::Api {
                status: 500,
                code: "InternalServerError".into(),
                message: "Backend unavailable".into(),
            },
        );

        let first = configurator(&cloud).configure(&groups()).await.unwrap();

        let failed: Vec<_> = first.failed_steps().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].step, SamlStep::SigningCertificate);
        let sp = cloud.service_principal(&first.application.app_id).unwrap();
        assert!(sp.preferred_token_signing_key_thumbprint.is_none());
        let thumbprint = sp.signing_key_thumbprints[0].clone();
        assert!(failed[0].remediation.as_deref().unwrap().contains(&thumbprint));
        assert!(failed[0].detail.as_deref().unwrap().contains("Backend unavailable"));

        cloud.clear_faults();
        let second = configurator(&cloud).configure(&groups()).await.unwrap();

        assert_eq!(status_of(&second, SamlStep::SigningCertificate), StepStatus::Applied);
        assert_eq!(cloud.op_calls(MemoryOp::AddTokenSigningCertificate), 1);
        let sp = cloud.service_principal(&second.application.app_id).unwrap();
        assert_eq!(sp.signing_key_thumbprints, vec![thumbprint.clone()]);
        assert_eq!(sp.preferred_token_signing_key_thumbprint, Some(thumbprint));
    }

    #[tokio::test]
    async fn test_existing_assignment_with_other_role_is_kept() {
        let cloud = Arc::new(MemoryCloud::new());
        let first = configurator(&cloud).configure(&[]).await.unwrap();
        cloud
            .create_app_role_assignment(&AppRoleAssignmentEdge {
                service_principal_id: first.service_principal.id.clone(),
                principal_id: "grp-0".into(),
                app_role_id: "some-other-role".into(),
            })
            .await
            .unwrap();

        let second = configurator(&cloud).configure(&groups()).await.unwrap();

        let assignment_statuses: Vec<_> = second
            .steps
            .iter()
            .filter(|s| s.step == SamlStep::GroupAssignment)
            .map(|s| s.status)
            .collect();
        assert_eq!(
            assignment_statuses,
            vec![StepStatus::Unchanged, StepStatus::Applied, StepStatus::Applied]
        );
    }

    #[tokio::test]
    async fn test_missing_group_is_skipped() {
        let cloud = Arc::new(MemoryCloud::new());
        let groups = vec![ManagedGroup {
            display_name: "OpenCTI-Analysts".into(),
            object_id: None,
        }];

        let result = configurator(&cloud).configure(&groups).await.unwrap();

        assert_eq!(status_of(&result, SamlStep::GroupAssignment), StepStatus::Skipped);
        assert_eq!(cloud.op_calls(MemoryOp::CreateAppRoleAssignment), 0);
    }

    #[test]
    fn test_user_role_fallback() {
        let mut app = Application::default();
        assert_eq!(user_role_id(&app), DEFAULT_ACCESS_ROLE_ID);

        app.app_roles = vec![
            AppRole {
                id: "disabled".into(),
                value: Some("User".into()),
                display_name: None,
                is_enabled: false,
            },
            AppRole {
                id: "user".into(),
                value: None,
                display_name: Some("User".into()),
                is_enabled: true,
            },
        ];
        assert_eq!(user_role_id(&app), "user");
    }
}
