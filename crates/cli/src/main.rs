use std::path::PathBuf;

use {
    clap::{Args, Parser, Subcommand},
    relay_config::RelayConfig,
    relay_store::{MessageStore, SqliteMessageStore},
    secrecy::SecretString,
    tracing::info,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "relay", about = "Relay: real-time one-to-one message relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Directory to search for relay.{toml,yaml,yml,json}.
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server.
    Gateway(GatewayArgs),
    /// Print a participant's stored history as JSON lines.
    History {
        identity_id: String,
        #[arg(long, env = "RELAY_DATABASE")]
        database: Option<PathBuf>,
    },
}

#[derive(Args, Default)]
struct GatewayArgs {
    #[arg(long)]
    bind: Option<String>,
    #[arg(long, env = "PORT")]
    port: Option<u16>,
    #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,
    #[arg(long, env = "RELAY_DATABASE")]
    database: Option<PathBuf>,
    #[arg(long, env = "CLIENT_URL")]
    allowed_origin: Option<String>,
}

impl GatewayArgs {
    /// Flags and their environment variables win over file values.
    fn apply(self, config: &mut RelayConfig) {
        if let Some(bind) = self.bind {
            config.server.bind = bind;
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(secret) = self.jwt_secret {
            config.auth.jwt_secret = Some(SecretString::new(secret));
        }
        if let Some(database) = self.database {
            config.storage.database = Some(database);
        }
        if let Some(origin) = self.allowed_origin {
            config.server.allowed_origin = Some(origin);
        }
    }
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

async fn print_history(config: &RelayConfig, identity_id: &str) -> anyhow::Result<()> {
    let store = SqliteMessageStore::open(&config.storage.database_path()).await?;
    for message in store.query_by_participant(identity_id).await? {
        println!("{}", serde_json::to_string(&message)?);
    }
    store.close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    info!(version = env!("CARGO_PKG_VERSION"), "relay starting");

    if let Some(dir) = cli.config_dir {
        relay_config::set_config_dir(dir);
    }
    let mut config = relay_config::discover_and_load();

    match cli.command {
        Commands::Gateway(args) => {
            args.apply(&mut config);
            relay_gateway::start_gateway(config).await
        },
        Commands::History {
            identity_id,
            database,
        } => {
            if database.is_some() {
                config.storage.database = database;
            }
            print_history(&config, &identity_id).await
        },
    }
}
