use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use signal_relay::providers::{DisabledImages, ForgeClient, ImageBackend, OpenAiClient};
use signal_relay::{Config, GatewaySession, Persona};

/// Signal Relay - chat with a local LLM over Signal
#[derive(Parser)]
#[command(name = "signal-relay", version, about)]
struct Cli {
    /// Signal account the bot runs as (phone number)
    #[arg(short, long, env = "SIGNAL_ACCOUNT")]
    account: Option<String>,

    /// Address the signal-cli daemon listens on
    #[arg(long, env = "SIGNAL_DAEMON_ADDRESS")]
    daemon_address: Option<String>,

    /// Path to the signal-cli executable
    #[arg(long, env = "SIGNAL_CLI_PATH")]
    signal_cli: Option<std::path::PathBuf>,

    /// Persona TOML file
    #[arg(short, long, env = "PERSONA_FILE")]
    persona_file: Option<std::path::PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List the models the chat backend advertises
    Models,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = match cli.verbose {
        0 => "info,signal_relay=info",
        1 => "info,signal_relay=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::from_env();
    if let Some(account) = cli.account {
        config.signal.account = account;
    }
    if let Some(address) = cli.daemon_address {
        config.signal.daemon_address = address;
    }
    if let Some(path) = cli.signal_cli {
        config.signal.cli_path = path;
    }
    if let Some(path) = cli.persona_file {
        config.persona_file = Some(path);
    }

    let llm = OpenAiClient::new(&config.llm.api_url, &config.llm.model)?
        .with_api_key(config.llm.api_key.clone());

    if let Some(Command::Models) = cli.command {
        return list_models(&llm).await;
    }

    config.validate()?;

    let persona = match &config.persona_file {
        Some(path) => Persona::load(path)?,
        None => Persona::default(),
    };

    let model = llm.detect_model().await;
    let llm = llm.with_model(model);

    let images: Arc<dyn ImageBackend> = match &config.forge {
        Some(forge) => Arc::new(ForgeClient::new(
            &forge.api_url,
            &forge.image_dir,
            forge.settings.clone(),
        )?),
        None => {
            tracing::info!("FORGE_API_URL not set, image commands disabled");
            Arc::new(DisabledImages)
        }
    };

    tracing::info!(
        account = %config.signal.account,
        daemon = %config.signal.daemon_address,
        model = llm.model(),
        "starting signal relay"
    );

    let mut session = GatewaySession::start(&config, &persona, Arc::new(llm), images).await?;

    let lost = tokio::select! {
        () = shutdown_signal() => {
            tracing::info!("shutdown requested");
            false
        }
        () = session.closed() => {
            tracing::warn!("connection to signal-cli daemon lost");
            true
        }
    };

    session.stop().await;

    if lost {
        anyhow::bail!("signal-cli daemon connection closed unexpectedly");
    }
    Ok(())
}

async fn list_models(llm: &OpenAiClient) -> anyhow::Result<()> {
    let models = llm.list_models().await?;
    if models.is_empty() {
        println!("No models advertised");
    }
    for model in models {
        println!("{model}");
    }
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
