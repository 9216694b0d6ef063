//! vss-validate - validate one certificate from the command line
//!
//! Loads the engine configuration, runs a single validation and prints the
//! response JSON. Exit status is 0 for `valid`, 1 for `invalid` and 2 when the
//! request or configuration is rejected.

use base64::{engine::general_purpose, Engine};
use chrono::{DateTime, Utc};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vss_engine::pkix::codec::decode_pem_bundle;
use vss_engine::{Config, EngineBuilder, ValidationRequest, Verdict, VssError};

#[derive(Parser)]
#[command(name = "vss-validate")]
#[command(about = "Validate an X.509 certificate against a configured validation policy")]
#[command(version)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long)]
    config: PathBuf,

    /// Validation policy OID
    #[arg(long)]
    policy: String,

    /// Certificate file: PEM, DER, or base64 of DER
    #[arg(long)]
    certificate: PathBuf,

    /// Want-back artifact to include (repeatable)
    #[arg(long = "want-back")]
    want_back: Vec<String>,

    /// Validation time (RFC 3339); defaults to now
    #[arg(long)]
    at: Option<DateTime<Utc>>,
}

fn read_certificate(path: &PathBuf) -> Result<String, VssError> {
    let bytes = std::fs::read(path)?;

    match decode_pem_bundle(&bytes) {
        Ok(certs) if !certs.is_empty() => Ok(general_purpose::STANDARD.encode(certs[0].der())),
        _ => String::from_utf8(bytes)
            .map(|s| s.trim().to_string())
            .map_err(|_| VssError::CertificateDecode(format!("{} is neither PEM, DER nor base64", path.display()))),
    }
}

async fn run(cli: Cli) -> Result<Verdict, VssError> {
    let config = Config::from_file(&cli.config)?;
    let engine = EngineBuilder::from_config(&config)
        .with_background_refresh(false)
        .build()
        .await?;

    let request = ValidationRequest::new(cli.policy, read_certificate(&cli.certificate)?, cli.want_back);
    let at = cli.at.unwrap_or_else(Utc::now).timestamp();

    let response = engine.validate(&request, at).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);

    Ok(response.result)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    vss_engine::panic_handler::install_panic_hook();

    let cli = Cli::parse();
    info!(config = %cli.config.display(), policy = %cli.policy, "Validating certificate");

    let code = match run(cli).await {
        Ok(Verdict::Valid) => 0,
        Ok(Verdict::Invalid) => 1,
        Err(e) => {
            error!(error = %e, "Validation request failed");
            eprintln!("error: {}", e);
            2
        }
    };

    std::process::exit(code);
}
