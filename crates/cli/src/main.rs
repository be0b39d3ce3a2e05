mod credential_commands;

use std::{path::PathBuf, sync::Arc};

use {
    anyhow::Context,
    clap::{Parser, Subcommand},
    tokio::io::BufReader,
    tracing::{info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use {
    wagate_config::WagateConfig,
    wagate_gateway::{methods::MethodRegistry, server::serve_lines, state::GatewayState},
    wagate_whatsapp::{SessionRegistry, SessionSettings, StdioBridgeConnector, open_store},
};

#[derive(Parser)]
#[command(name = "wagate", about = "Multi-session messaging gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Read wagate.{toml,yaml,yml,json} from this directory only.
    #[arg(long, global = true, env = "WAGATE_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve JSON-line requests on stdin, answering on stdout.
    Serve {
        /// Bridge executable; overrides `bridge.command`.
        #[arg(long, env = "WAGATE_BRIDGE_COMMAND")]
        bridge_command: Option<String>,
        /// Argument passed to the bridge (repeatable); replaces `bridge.args`.
        #[arg(long = "bridge-arg", allow_hyphen_values = true)]
        bridge_args: Vec<String>,
    },
    /// Stored credential management.
    Credentials {
        #[command(subcommand)]
        action: credential_commands::CredentialAction,
    },
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the resolved configuration as TOML.
    Show,
    /// Print the path of the config file in use.
    Path,
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // stdout carries protocol frames; logs always go to stderr.
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_target(true)
                    .with_thread_ids(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

async fn serve(
    mut config: WagateConfig,
    bridge_command: Option<String>,
    bridge_args: Vec<String>,
) -> anyhow::Result<()> {
    if let Some(command) = bridge_command {
        config.bridge.command = Some(command);
    }
    if !bridge_args.is_empty() {
        config.bridge.args = bridge_args;
    }

    let connector = StdioBridgeConnector::from_config(&config.bridge)
        .context("no bridge command configured; set bridge.command or pass --bridge-command")?;
    let store = open_store(&config.credentials, &wagate_config::data_dir())?;
    info!(
        bridge = connector.command(),
        backend = ?config.credentials.backend,
        "session core ready"
    );

    let registry = Arc::new(SessionRegistry::new(
        Arc::new(connector),
        store,
        SessionSettings::from(&config),
    ));
    let state = GatewayState::new(Arc::clone(&registry));
    let methods = Arc::new(MethodRegistry::new());

    let served = tokio::select! {
        result = serve_lines(
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
            state,
            methods,
        ) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
            Ok(())
        },
    };

    registry.shutdown().await;
    info!("wagate stopped");
    served
}

fn show_config(action: ConfigAction, config: &WagateConfig) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => println!("{}", toml::to_string_pretty(config)?),
        ConfigAction::Path => match wagate_config::find_config_file() {
            Some(path) => println!("{}", path.display()),
            None => warn!("no config file found, running on defaults"),
        },
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    if let Some(dir) = &cli.config_dir {
        wagate_config::set_config_dir(dir.clone());
    }
    info!(version = env!("CARGO_PKG_VERSION"), "wagate starting");
    let config = wagate_config::discover_and_load();

    match cli.command {
        Commands::Serve {
            bridge_command,
            bridge_args,
        } => serve(config, bridge_command, bridge_args).await,
        Commands::Credentials { action } => {
            credential_commands::handle_credentials(action, &config, &wagate_config::data_dir())
                .await
        },
        Commands::Config { action } => show_config(action, &config),
    }
}
