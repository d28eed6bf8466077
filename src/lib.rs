//! Idempotent Azure identity bootstrap for OpenCTI deployments.
//!
//! A run reconciles the resource group, managed identity, role grants,
//! security groups and federated credentials, drives the SAML application to
//! its target configuration, extracts the signing certificate from the
//! tenant's federation metadata and emits the values the deployment
//! templates consume. Every step can be re-run safely.

pub mod azure;
pub mod config;
pub mod federation;
#[cfg(feature = "cli")]
pub mod observability;
pub mod output;
pub mod provider;
pub mod provision;
pub mod reconcile;
pub mod saml;
pub mod settle;

#[cfg(test)]
mod tests;

pub use config::ProvisionConfig;
pub use provision::{ProvisionError, Provisioner, ProvisioningReport};
