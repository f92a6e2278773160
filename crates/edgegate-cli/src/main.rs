use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use edgegate_auth::{
    KeyProvider, TokenVerifier, VerificationResult, VerifierConfig, decode_unverified,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "edgegate", about = "Inspect and verify edge proxy bearer tokens")]
struct Cli {
    #[arg(long, global = true)]
    json: bool,

    /// TOML file with verifier settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Expected project id (overrides config and FIREBASE_PROJECT_ID)
    #[arg(long, global = true)]
    project_id: Option<String>,

    /// Key document URL (overrides config and EDGEGATE_KEYS_URL)
    #[arg(long, global = true)]
    keys_url: Option<String>,

    /// Log verification steps to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Verify a token and print the authenticated subject
    Verify {
        #[arg(long, conflicts_with = "token_env")]
        token: Option<String>,
        /// Read the token from this environment variable
        #[arg(long)]
        token_env: Option<String>,
    },
    /// Fetch the signing keys and list their ids
    Keys,
    /// Decode a token without verifying it
    Inspect {
        #[arg(long)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Verify { token, token_env } => {
            let token = match (token, token_env) {
                (Some(token), _) => token.clone(),
                (None, Some(var)) => std::env::var(var)
                    .map_err(|e| anyhow::anyhow!("cannot read token from ${var}: {e}"))?,
                (None, None) => anyhow::bail!("one of --token or --token-env is required"),
            };
            let config = load_config(&cli)?;
            let verifier = TokenVerifier::from_config(&config)?;

            match verifier.verify_configured(token.trim()).await {
                VerificationResult::Authenticated { subject } => {
                    pout(
                        cli.json,
                        serde_json::json!({"ok": true, "subject": subject}),
                        &format!("Authenticated: {subject}"),
                    )?;
                    Ok(ExitCode::SUCCESS)
                }
                VerificationResult::Rejected { reason } => {
                    pout(
                        cli.json,
                        serde_json::json!({
                            "ok": false,
                            "reason": reason,
                            "message": reason.to_string(),
                        }),
                        &format!("Rejected: {reason} ({})", reason.as_str()),
                    )?;
                    Ok(ExitCode::from(2))
                }
            }
        }
        Commands::Keys => {
            let config = load_config(&cli)?;
            let provider = KeyProvider::new(&config)?;
            let keys = provider.signing_keys().await?;
            let kids: Vec<&str> = keys.kids().collect();

            let mut text = format!(
                "{} signing keys from {} (expires at {})",
                kids.len(),
                provider.keys_url(),
                keys.expires_at()
            );
            for kid in &kids {
                text.push_str("\n  ");
                text.push_str(kid);
            }
            pout(
                cli.json,
                serde_json::json!({
                    "keys_url": provider.keys_url(),
                    "kids": kids,
                    "expires_at": keys.expires_at(),
                }),
                &text,
            )?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Inspect { token } => {
            let (header, payload) = decode_unverified(token.trim()).ok_or_else(|| {
                anyhow::anyhow!("token is not a decodable header.payload.signature")
            })?;
            let text = format!(
                "header:  {}\npayload: {}\n(signature NOT verified)",
                serde_json::to_string_pretty(&header)?,
                serde_json::to_string_pretty(&payload)?
            );
            pout(
                cli.json,
                serde_json::json!({"header": header, "payload": payload, "verified": false}),
                &text,
            )?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Defaults, then `--config`, then the environment, then flags.
fn load_config(cli: &Cli) -> anyhow::Result<VerifierConfig> {
    let config = match &cli.config {
        Some(path) => {
            let content = fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
            VerifierConfig::from_toml_str(&content)?
        }
        None => VerifierConfig::default(),
    };
    let mut config = config.with_env_overrides()?;

    if let Some(project_id) = &cli.project_id {
        config.project_id.clone_from(project_id);
    }
    if let Some(keys_url) = &cli.keys_url {
        config.keys_url.clone_from(keys_url);
    }
    tracing::debug!(
        project_id = %config.project_id,
        keys_url = %config.keys_url,
        "resolved configuration"
    );
    Ok(config)
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "edgegate_auth=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub fn pout(json_mode: bool, value: serde_json::Value, text: &str) -> anyhow::Result<()> {
    if json_mode {
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("{text}");
    }
    Ok(())
}
