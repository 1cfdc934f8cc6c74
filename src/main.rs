use std::path::PathBuf;
use std::time::UNIX_EPOCH;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tracing::info;

use waav_voice::VoiceConfig;
use waav_voice::core::realtime::{TokenScope, TokenSource};

/// WaaV Voice - real-time voice ordering transport
#[derive(Parser, Debug)]
#[command(name = "waav-voice")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Subcommand to run
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Request a session token and print its scope and expiry
    Token {
        /// Credential for the token endpoint (defaults to the configured api_key)
        #[arg(long = "auth-token", env = "VOICE_AUTH_TOKEN")]
        auth_token: Option<String>,

        /// Restaurant the token is scoped to
        #[arg(short = 'r', long = "restaurant")]
        restaurant: String,

        /// Client identifier the token is scoped to
        #[arg(long = "client", default_value = "waav-voice-cli")]
        client: String,
    },

    /// Validate and print the effective configuration (secrets redacted)
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    // Initialize crypto provider for TLS connections
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let config = if let Some(config_path) = cli.config {
        info!("Loading configuration from {}", config_path.display());
        VoiceConfig::from_file(&config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        VoiceConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    match cli.command {
        Commands::Config => {
            let rendered = serde_yaml::to_string(&config.redacted())
                .map_err(|e| anyhow!("Failed to render configuration: {e}"))?;
            print!("{rendered}");
        }
        Commands::Token {
            auth_token,
            restaurant,
            client,
        } => {
            let auth_token = auth_token
                .or_else(|| config.api_key.clone())
                .ok_or_else(|| anyhow!("No credential: pass --auth-token or set VOICE_API_KEY"))?;
            let auth_token = zeroize::Zeroizing::new(auth_token);

            let provider = config.token_provider()?;
            let scope = TokenScope {
                restaurant_id: restaurant,
                client_id: client,
            };
            info!(endpoint = provider.endpoint(), "Requesting session token");

            let token = provider.fetch_token(&auth_token, &scope).await?;
            let expires_at = token
                .expires_at()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();

            println!("restaurant_id: {}", token.scope_restaurant_id());
            println!("client_id:     {}", token.scope_client_id());
            println!("expires_at:    {expires_at}");
            println!("expires_in:    {}s", token.remaining().as_secs());
            println!(
                "menu_context:  {}",
                if token.menu_context().is_some() {
                    "present"
                } else {
                    "none"
                }
            );
        }
    }

    Ok(())
}
