//! Observed SAML configuration of an application / service principal pair.

use std::fmt;

use serde::Serialize;

use crate::provider::{Application, ServicePrincipal};

/// Value of the application's `groupMembershipClaims`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GroupsClaimMode {
    None,
    SecurityGroup,
    All,
    DirectoryRole,
    ApplicationGroup,
    Other(String),
}

impl GroupsClaimMode {
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            None => GroupsClaimMode::None,
            Some(v) if v.eq_ignore_ascii_case("none") => GroupsClaimMode::None,
            Some(v) if v.eq_ignore_ascii_case("SecurityGroup") => GroupsClaimMode::SecurityGroup,
            Some(v) if v.eq_ignore_ascii_case("All") => GroupsClaimMode::All,
            Some(v) if v.eq_ignore_ascii_case("DirectoryRole") => GroupsClaimMode::DirectoryRole,
            Some(v) if v.eq_ignore_ascii_case("ApplicationGroup") => {
                GroupsClaimMode::ApplicationGroup
            }
            Some(v) => GroupsClaimMode::Other(v.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            GroupsClaimMode::None => "None",
            GroupsClaimMode::SecurityGroup => "SecurityGroup",
            GroupsClaimMode::All => "All",
            GroupsClaimMode::DirectoryRole => "DirectoryRole",
            GroupsClaimMode::ApplicationGroup => "ApplicationGroup",
            GroupsClaimMode::Other(v) => v,
        }
    }
}

impl fmt::Display for GroupsClaimMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derived from live attributes on every run; never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SamlApplicationState {
    pub identifier_uri_set: bool,
    pub redirect_configured: bool,
    pub groups_claim_mode: GroupsClaimMode,
    /// A preferred token-signing certificate is set.
    pub signing_cert_present: bool,
    /// An attached signing key that is not preferred yet, left behind when
    /// an earlier run added a certificate but could not activate it.
    pub unpreferred_signing_key: Option<String>,
    pub sso_mode_is_saml: bool,
}

impl SamlApplicationState {
    pub fn observe(app: &Application, sp: &ServicePrincipal, callback_url: &str) -> Self {
        let identifier_uri = identifier_uri_for(&app.app_id);
        Self {
            identifier_uri_set: app.identifier_uris.iter().any(|u| *u == identifier_uri),
            redirect_configured: app.redirect_uris.iter().any(|u| u == callback_url),
            groups_claim_mode: GroupsClaimMode::parse(app.group_membership_claims.as_deref()),
            signing_cert_present: sp.preferred_token_signing_key_thumbprint.is_some(),
            unpreferred_signing_key: match &sp.preferred_token_signing_key_thumbprint {
                Some(_) => None,
                None => sp.signing_key_thumbprints.first().cloned(),
            },
            sso_mode_is_saml: sp
                .preferred_single_sign_on_mode
                .as_deref()
                .is_some_and(|m| m.eq_ignore_ascii_case("saml")),
        }
    }

    /// Whether every configurable attribute is already in its target state.
    pub fn is_complete(&self) -> bool {
        self.identifier_uri_set
            && self.redirect_configured
            && self.groups_claim_mode == GroupsClaimMode::ApplicationGroup
            && self.signing_cert_present
            && self.sso_mode_is_saml
    }
}

/// Entity ID of the application: `api://<clientId>`.
pub fn identifier_uri_for(client_id: &str) -> String {
    format!("api://{client_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CALLBACK: &str = "https://opencti.example.com/auth/saml/callback";

    #[test]
    fn test_fresh_template_state() {
        let app = Application {
            object_id: "obj".into(),
            app_id: "app".into(),
            display_name: "OpenCTI".into(),
            ..Default::default()
        };
        let sp = ServicePrincipal {
            id: "sp".into(),
            app_id: "app".into(),
            ..Default::default()
        };

        let state = SamlApplicationState::observe(&app, &sp, CALLBACK);

        assert!(!state.identifier_uri_set);
        assert!(!state.redirect_configured);
        assert_eq!(state.groups_claim_mode, GroupsClaimMode::None);
        assert!(!state.signing_cert_present);
        assert!(!state.is_complete());
    }

    #[test]
    fn test_configured_state() {
        let app = Application {
            app_id: "app".into(),
            identifier_uris: vec!["api://other".into(), "api://app".into()],
            redirect_uris: vec![CALLBACK.into()],
            group_membership_claims: Some("ApplicationGroup".into()),
            ..Default::default()
        };
        let sp = ServicePrincipal {
            preferred_single_sign_on_mode: Some("saml".into()),
            preferred_token_signing_key_thumbprint: Some("AB".into()),
            ..Default::default()
        };

        assert!(SamlApplicationState::observe(&app, &sp, CALLBACK).is_complete());
    }

    #[test]
    fn test_attached_key_without_preference() {
        let app = Application::default();
        let mut sp = ServicePrincipal {
            signing_key_thumbprints: vec!["AB".into()],
            ..Default::default()
        };

        let state = SamlApplicationState::observe(&app, &sp, CALLBACK);
        assert!(!state.signing_cert_present);
        assert_eq!(state.unpreferred_signing_key.as_deref(), Some("AB"));

        sp.preferred_token_signing_key_thumbprint = Some("AB".into());
        let state = SamlApplicationState::observe(&app, &sp, CALLBACK);
        assert!(state.signing_cert_present);
        assert!(state.unpreferred_signing_key.is_none());
    }

    #[test]
    fn test_groups_claim_parse() {
        assert_eq!(
            GroupsClaimMode::parse(Some("securitygroup")),
            GroupsClaimMode::SecurityGroup
        );
        assert_eq!(
            GroupsClaimMode::parse(Some("Custom")).as_str(),
            "Custom"
        );
    }
}
