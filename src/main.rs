use std::{
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use clap::Parser;
use cti_provision::{
    Provisioner,
    azure::AzureCloud,
    config::{FederationConfig, ObservabilityConfig, OutputFormat, ProvisionConfig},
    federation::MetadataCertificateExtractor,
    observability::init_tracing,
    provider::MemoryCloud,
    settle::Settler,
};

const DEFAULT_CONFIG_PATH: &str = "cti-provision.toml";

#[derive(Parser, Debug)]
#[command(version, about = "OpenCTI Azure identity bootstrap", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Path to config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Provision every resource and emit the deployment outputs
    Run {
        /// Reconcile against an in-memory cloud instead of Azure
        #[arg(long)]
        dry_run: bool,
        /// Output file for the deployment values (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Rendering of the deployment values (defaults to `outputs.format`)
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,
        /// Also write the full run report as JSON
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Extract the SAML signing certificate from federation metadata
    Cert {
        /// Directory (tenant) ID
        #[arg(long)]
        tenant: String,
        /// Client ID of the SAML application
        #[arg(long)]
        client_id: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Path to create the config file (defaults to --config)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Export the JSON schema for the configuration file
    Schema {
        /// Output file (defaults to stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Starter configuration written by `init`.
fn default_config_toml() -> &'static str {
    r#"# cti-provision configuration
#
# Values in ${VAR} form are read from the environment.

[azure]
tenant_id = "00000000-0000-0000-0000-000000000000"
subscription_id = "00000000-0000-0000-0000-000000000000"
location = "westeurope"

# Defaults to the `az login` session.
# [auth]
# type = "client_secret"
# client_id = "${AZURE_CLIENT_ID}"
# client_secret = "${AZURE_CLIENT_SECRET}"

[resources]
resource_group = "rg-opencti-001"
managed_identity = "id-opencti-001"

[resources.tags]
workload = "opencti"

# [[resources.role_assignments]]
# role = "AcrPull"
# scope = "subscription"

# [[resources.federated_credentials]]
# name = "fic-opencti"
# issuer = "https://oidc.example.com/issuer"
# subject = "system:serviceaccount:opencti:opencti"

[saml]
callback_url = "https://opencti.example.com/auth/saml/callback"
# notification_email = "secops@example.com"

[settle]
mode = "fixed"

[outputs]
app_name = "opencti"
format = "env"

[observability.logging]
level = "info"
format = "compact"
"#
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match args.command {
        Command::Run {
            dry_run,
            output,
            format,
            report,
        } => run_provision(&args.config, dry_run, output, format, report).await,
        Command::Cert { tenant, client_id } => run_cert(&args.config, &tenant, &client_id).await,
        Command::Init { output, force } => run_init(output.unwrap_or(args.config), force),
        Command::Schema { output } => run_schema_export(output),
    }
}

fn load_config(path: &Path) -> Option<ProvisionConfig> {
    match ProvisionConfig::from_file(path) {
        Ok(config) => Some(config),
        Err(e) => {
            eprintln!("Error: {e}");
            None
        }
    }
}

fn start_tracing(config: &ObservabilityConfig) {
    if let Err(e) = init_tracing(config) {
        eprintln!("Warning: {e}");
    }
}

async fn run_provision(
    config_path: &Path,
    dry_run: bool,
    output: Option<PathBuf>,
    format: Option<OutputFormat>,
    report_path: Option<PathBuf>,
) -> ExitCode {
    let Some(config) = load_config(config_path) else {
        return ExitCode::FAILURE;
    };
    start_tracing(&config.observability);
    let format = format.unwrap_or(config.outputs.format);

    let provisioner = if dry_run {
        tracing::info!("Dry run: reconciling against an in-memory cloud");
        let cloud = MemoryCloud::with_subscription(config.azure.subscription_id.clone())
            .with_tenant(config.azure.tenant_id.clone());
        Provisioner::new(config, Arc::new(cloud), None).with_settler(Settler::immediate())
    } else {
        let http = match config.http_client.build_client() {
            Ok(http) => http,
            Err(e) => {
                eprintln!("Error: failed to build HTTP client: {e}");
                return ExitCode::FAILURE;
            }
        };
        let cloud = match AzureCloud::from_config(&config, http) {
            Ok(cloud) => cloud,
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::FAILURE;
            }
        };
        let extractor = match MetadataCertificateExtractor::new(&config.federation) {
            Ok(extractor) => Some(extractor),
            Err(e) => {
                tracing::warn!(error = %e, "Certificate extraction disabled");
                None
            }
        };
        Provisioner::new(config, Arc::new(cloud), extractor)
    };

    let report = match provisioner.run().await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "Provisioning aborted");
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    eprint!("{}", report.render_summary());

    if let Some(path) = report_path {
        match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&path, json) {
                    eprintln!("Failed to write report to {}: {e}", path.display());
                }
            }
            Err(e) => eprintln!("Failed to serialize report: {e}"),
        }
    }

    let rendered = match report.outputs.render(format) {
        Ok(rendered) => rendered,
        Err(e) => {
            eprintln!("Error: failed to render outputs: {e}");
            return ExitCode::FAILURE;
        }
    };
    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, rendered) {
                eprintln!("Failed to write outputs to {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
            eprintln!("Outputs written to {}", path.display());
        }
        None => print!("{rendered}"),
    }

    ExitCode::SUCCESS
}

/// Federation settings come from the config file when one is present.
async fn run_cert(config_path: &Path, tenant: &str, client_id: &str) -> ExitCode {
    let federation = if config_path.exists() {
        let Some(config) = load_config(config_path) else {
            return ExitCode::FAILURE;
        };
        start_tracing(&config.observability);
        config.federation
    } else {
        start_tracing(&ObservabilityConfig::default());
        FederationConfig::default()
    };

    let result = match MetadataCertificateExtractor::new(&federation) {
        Ok(extractor) => extractor.extract_certificate(tenant, client_id).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(payload) => {
            print!("{}", payload.pem());
            #[cfg(feature = "cert-inspect")]
            {
                match cti_provision::federation::inspect(&payload) {
                    Ok(details) => eprintln!(
                        "subject {}, thumbprint {}, expires {}{}",
                        details.subject,
                        details.thumbprint_sha1,
                        details.not_after,
                        if details.expired { " (EXPIRED)" } else { "" }
                    ),
                    Err(reason) => eprintln!("Warning: could not decode certificate: {reason}"),
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("{}", e.remediation());
            ExitCode::FAILURE
        }
    }
}

/// Create a starter configuration file.
fn run_init(output_path: PathBuf, force: bool) -> ExitCode {
    if output_path.exists() && !force {
        eprintln!(
            "Config file already exists: {}\nUse --force to overwrite.",
            output_path.display()
        );
        return ExitCode::FAILURE;
    }

    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
        && let Err(e) = std::fs::create_dir_all(parent)
    {
        eprintln!("Failed to create directory {}: {}", parent.display(), e);
        return ExitCode::FAILURE;
    }

    if let Err(e) = std::fs::write(&output_path, default_config_toml()) {
        eprintln!("Failed to write config file: {}", e);
        return ExitCode::FAILURE;
    }

    println!("Created config file: {}", output_path.display());
    println!();
    println!("Fill in the tenant and subscription, then run:");
    println!("  cti-provision --config {} run --dry-run", output_path.display());
    ExitCode::SUCCESS
}

/// Export JSON schema for the configuration file to file or stdout
#[cfg(feature = "json-schema")]
fn run_schema_export(output: Option<PathBuf>) -> ExitCode {
    let content = match ProvisionConfig::json_schema_string() {
        Ok(content) => content,
        Err(e) => {
            eprintln!("Failed to generate schema: {e}");
            return ExitCode::FAILURE;
        }
    };

    match output {
        Some(path) => {
            if let Err(e) = std::fs::write(&path, &content) {
                eprintln!("Failed to write to {}: {}", path.display(), e);
                return ExitCode::FAILURE;
            }
            eprintln!("Config JSON schema written to {}", path.display());
        }
        None => println!("{}", content),
    }
    ExitCode::SUCCESS
}

#[cfg(not(feature = "json-schema"))]
fn run_schema_export(output: Option<PathBuf>) -> ExitCode {
    let _ = output;
    eprintln!("Error: JSON schema export requires the 'json-schema' feature");
    ExitCode::FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starter_config_parses() {
        let config = ProvisionConfig::from_str(default_config_toml()).unwrap();

        assert_eq!(config.resources.resource_group, "rg-opencti-001");
        assert_eq!(config.resources.tags["workload"], "opencti");
        assert_eq!(config.outputs.format, OutputFormat::Env);
    }

    #[test]
    fn test_parse_run_arguments() {
        let args = Args::parse_from([
            "cti-provision",
            "--config",
            "prod.toml",
            "run",
            "--dry-run",
            "--format",
            "json",
        ]);

        assert_eq!(args.config, PathBuf::from("prod.toml"));
        match args.command {
            Command::Run {
                dry_run, format, ..
            } => {
                assert!(dry_run);
                assert_eq!(format, Some(OutputFormat::Json));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_init_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cti-provision.toml");
        std::fs::write(&path, "keep").unwrap();

        assert_eq!(run_init(path.clone(), false), ExitCode::FAILURE);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "keep");

        assert_eq!(run_init(path.clone(), true), ExitCode::SUCCESS);
        assert!(ProvisionConfig::from_file(&path).is_ok());
    }
}
