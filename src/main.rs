use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use peril_pubsub::config::{self, PerilConfig};
use peril_pubsub::env::apply_env_overrides;
use peril_pubsub::game::GameLogWriter;
use peril_pubsub::models::PlayingState;
use peril_pubsub::rabbitmq::{connect, AmqpConnection, PubSub};
use peril_pubsub::{AckDecision, Binding, DurabilityMode};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Peril messaging: game-log server, pause control and a pause listener
#[derive(Parser)]
#[command(name = "peril", version)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Override the AMQP connection URI
    #[arg(long, value_name = "URI", global = true)]
    amqp_uri: Option<String>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, value_name = "LEVEL", global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Consume game logs into a file until Ctrl+C
    Server {
        #[arg(long, value_name = "FILE", default_value = "game.log")]
        log_file: PathBuf,
    },
    /// Tell every client the game is paused
    Pause,
    /// Tell every client the game is running again
    Resume,
    /// Listen for pause state changes as the given player
    Client {
        #[arg(short, long)]
        username: String,
    },
    /// Write a configuration file with the default settings
    InitConfig {
        #[arg(value_name = "FILE", default_value = "peril.json")]
        path: PathBuf,
    },
}

fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with_target(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

fn load_config(args: &Args) -> Result<PerilConfig> {
    let mut config = config::load_config(args.config.as_deref())?;
    apply_env_overrides(&mut config)?;
    if let Some(uri) = &args.amqp_uri {
        config.connection.uri = uri.clone();
    }
    Ok(config)
}

async fn open_pubsub(config: &PerilConfig) -> Result<(Arc<AmqpConnection>, PubSub<AmqpConnection>)> {
    let connection = Arc::new(
        connect(&config.connection.uri, config.connection.connect_timeout())
            .await
            .context("Failed to connect to RabbitMQ")?,
    );
    let pubsub = PubSub::new(
        connection.clone(),
        config.routing.dead_letter_exchange.clone(),
        config.subscription.clone(),
    );
    Ok((connection, pubsub))
}

async fn run_server(config: &PerilConfig, log_file: PathBuf) -> Result<()> {
    let (connection, pubsub) = open_pubsub(config).await?;
    let routing = &config.routing;

    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .await
        .with_context(|| format!("Failed to open game log file {}", log_file.display()))?;

    let binding = Binding::new(
        routing.exchange_topic.clone(),
        routing.game_log_slug.clone(),
        routing.game_log_pattern(),
        DurabilityMode::Durable,
    );
    let subscription = pubsub.subscribe_json(&binding, GameLogWriter::new(file)).await?;

    info!("Peril game server connected to RabbitMQ, writing logs to {}", log_file.display());
    tokio::signal::ctrl_c().await?;

    info!("System is shutting down...");
    let (writer, stats) = subscription.stop_with_stats().await?;
    info!(
        written = writer.written(),
        decode_failures = stats.decode_failures,
        "Game log subscription stopped"
    );
    connection.close().await?;
    Ok(())
}

async fn publish_pause(config: &PerilConfig, is_paused: bool) -> Result<()> {
    let (connection, pubsub) = open_pubsub(config).await?;
    let channel = pubsub.publish_channel().await?;

    pubsub
        .publish(
            &channel,
            &config.routing.exchange_direct,
            &config.routing.pause_key,
            &PlayingState { is_paused },
        )
        .await?;
    info!(is_paused, "Published playing state");

    connection.close().await?;
    Ok(())
}

async fn run_client(config: &PerilConfig, username: &str) -> Result<()> {
    let (connection, pubsub) = open_pubsub(config).await?;
    let routing = &config.routing;

    let binding = Binding::new(
        routing.exchange_direct.clone(),
        routing.pause_queue(username),
        routing.pause_key.clone(),
        DurabilityMode::Transient,
    );
    let player = username.to_string();
    let subscription = pubsub
        .subscribe_json::<PlayingState, _>(&binding, move |state: PlayingState| {
            if state.is_paused {
                info!(player = %player, "Game paused");
            } else {
                info!(player = %player, "Game resumed");
            }
            AckDecision::Ack
        })
        .await?;

    info!(queue = subscription.queue(), "Listening for pause state, press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;

    if let Err(e) = subscription.stop().await {
        warn!("Failed to stop subscription cleanly: {}", e);
    }
    connection.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    if let Command::InitConfig { path } = &args.command {
        return config::create_default_config_file(path);
    }

    let config = load_config(&args)?;

    match args.command {
        Command::Server { log_file } => run_server(&config, log_file).await,
        Command::Pause => publish_pause(&config, true).await,
        Command::Resume => publish_pause(&config, false).await,
        Command::Client { username } => run_client(&config, &username).await,
        Command::InitConfig { .. } => Ok(()),
    }
}
