use clap::{Parser, Subcommand};
use lib::gateway::GatewayChatClient;

#[derive(Parser)]
#[command(name = "clawrelay")]
#[command(about = "OpenClaw pairing and chat relay", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Run the relay (pairing endpoints and chat over HTTP). Requires a pairing secret in config or OPENCLAW_PAIRING_SECRET.
    Serve {
        /// Config file path (default: CLAWRELAY_CONFIG_PATH or ~/.clawrelay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP port (default from config or 18790)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Check that a gateway accepts a token (connect and authenticate, no chat).
    Verify {
        /// Gateway URL, e.g. wss://gateway.example.com
        gateway_url: String,

        /// Gateway token (default: pairing.defaultGatewayToken or OPENCLAW_PAIRING_DEFAULT_GATEWAY_TOKEN)
        #[arg(long, short)]
        token: Option<String>,

        /// Config file path (default: CLAWRELAY_CONFIG_PATH or ~/.clawrelay/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!(
                "clawrelay {} (gateway protocol {})",
                env!("CARGO_PKG_VERSION"),
                lib::gateway::PROTOCOL_VERSION
            );
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("relay failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Verify {
            gateway_url,
            token,
            config,
        }) => {
            if let Err(e) = run_verify(gateway_url, token, config).await {
                log::error!("verify failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(p) = port {
        config.relay.port = p;
    }
    log::info!("starting relay on {}:{}", config.relay.bind, config.relay.port);
    lib::relay::run_relay(config, path).await
}

async fn run_verify(
    gateway_url: String,
    token: Option<String>,
    config_path: Option<std::path::PathBuf>,
) -> anyhow::Result<()> {
    let (config, _) = lib::config::load_config(config_path)?;
    let token = token
        .or_else(|| lib::config::resolve_issuer_defaults(&config).gateway_token)
        .ok_or_else(|| anyhow::anyhow!("no gateway token given (use --token)"))?;
    let client = GatewayChatClient::new(config.gateway.client_options());
    match client.verify(&gateway_url, &token).await {
        Ok(()) => {
            println!("ok: gateway accepted the token");
            Ok(())
        }
        Err(e) => Err(anyhow::anyhow!("{} ({})", e, e.code())),
    }
}
