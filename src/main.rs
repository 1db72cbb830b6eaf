//! dispatchd CLI entry point.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dispatchd", version)]
#[command(about = "Routes chat messages to remote coding-agent workers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Path to config file (optional)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand is given)
    Start {
        /// Run in the foreground instead of daemonizing
        #[arg(short, long)]
        foreground: bool,
    },
    /// Stop the running daemon
    Stop,
    /// Restart the daemon (stop + start)
    Restart {
        /// Run in the foreground instead of daemonizing
        #[arg(short, long)]
        foreground: bool,
    },
    /// Show status of the running daemon
    Status,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Start { foreground: false });

    match command {
        Command::Start { foreground } => cmd_start(cli.config, cli.debug, foreground),
        Command::Stop => cmd_stop(),
        Command::Restart { foreground } => {
            cmd_stop_if_running();
            cmd_start(cli.config, cli.debug, foreground)
        }
        Command::Status => cmd_status(),
    }
}

fn load_config(config_path: &Option<std::path::PathBuf>) -> anyhow::Result<dispatchd::config::Config> {
    dispatchd::config::Config::load(config_path.as_deref()).with_context(|| "failed to load configuration")
}

fn cmd_start(config_path: Option<std::path::PathBuf>, debug: bool, foreground: bool) -> anyhow::Result<()> {
    let paths = dispatchd::daemon::DaemonPaths::from_default();

    if let Some(pid) = dispatchd::daemon::is_running(&paths) {
        eprintln!("dispatchd is already running (pid {pid})");
        std::process::exit(1);
    }

    let config = load_config(&config_path)?;

    if !foreground {
        // Fork before creating any Tokio runtime: the runtime's I/O driver
        // and thread pool don't survive fork, so tracing init (and the OTLP
        // batch exporter it creates) must happen after this call.
        let paths = dispatchd::daemon::DaemonPaths::new(&config.data_dir);
        dispatchd::daemon::daemonize(&paths)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build Tokio runtime")?;

    runtime.block_on(async {
        let otel_provider = if foreground {
            dispatchd::daemon::init_foreground_tracing(debug, &config.telemetry)
        } else {
            let paths = dispatchd::daemon::DaemonPaths::new(&config.data_dir);
            dispatchd::daemon::init_background_tracing(&paths, debug, &config.telemetry)
        };

        run(config, foreground, otel_provider).await
    })
}

#[tokio::main]
async fn cmd_stop() -> anyhow::Result<()> {
    let paths = dispatchd::daemon::DaemonPaths::from_default();

    let Some(pid) = dispatchd::daemon::is_running(&paths) else {
        eprintln!("dispatchd is not running");
        std::process::exit(1);
    };

    match dispatchd::daemon::send_command(&paths, dispatchd::daemon::IpcCommand::Shutdown).await {
        Ok(dispatchd::daemon::IpcResponse::Ok) => {
            eprintln!("stopping dispatchd (pid {pid})...");
        }
        Ok(dispatchd::daemon::IpcResponse::Error { message }) => {
            eprintln!("shutdown failed: {message}");
            std::process::exit(1);
        }
        Ok(_) => {
            eprintln!("unexpected response from daemon");
            std::process::exit(1);
        }
        Err(error) => {
            eprintln!("failed to send shutdown command: {error}");
            std::process::exit(1);
        }
    }

    if dispatchd::daemon::wait_for_exit(pid) {
        eprintln!("dispatchd stopped");
    } else {
        eprintln!("dispatchd did not stop within 10 seconds (pid {pid})");
        std::process::exit(1);
    }

    Ok(())
}

/// Stop if running, don't error if not.
fn cmd_stop_if_running() {
    let paths = dispatchd::daemon::DaemonPaths::from_default();

    let Some(pid) = dispatchd::daemon::is_running(&paths) else {
        return;
    };

    let Ok(runtime) = tokio::runtime::Builder::new_current_thread().enable_all().build() else {
        return;
    };

    runtime.block_on(async {
        if let Ok(dispatchd::daemon::IpcResponse::Ok) =
            dispatchd::daemon::send_command(&paths, dispatchd::daemon::IpcCommand::Shutdown).await
        {
            eprintln!("stopping dispatchd (pid {pid})...");
            dispatchd::daemon::wait_for_exit(pid);
        }
    });
}

fn cmd_status() -> anyhow::Result<()> {
    let paths = dispatchd::daemon::DaemonPaths::from_default();

    let Some(_pid) = dispatchd::daemon::is_running(&paths) else {
        eprintln!("dispatchd is not running");
        std::process::exit(1);
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        match dispatchd::daemon::send_command(&paths, dispatchd::daemon::IpcCommand::Status).await {
            Ok(dispatchd::daemon::IpcResponse::Status { pid, uptime_seconds }) => {
                let hours = uptime_seconds / 3600;
                let minutes = (uptime_seconds % 3600) / 60;
                let seconds = uptime_seconds % 60;
                eprintln!("dispatchd is running");
                eprintln!("  pid:    {pid}");
                eprintln!("  uptime: {hours}h {minutes}m {seconds}s");
            }
            Ok(dispatchd::daemon::IpcResponse::Error { message }) => {
                eprintln!("status query failed: {message}");
                std::process::exit(1);
            }
            Ok(_) => {
                eprintln!("unexpected response from daemon");
                std::process::exit(1);
            }
            Err(error) => {
                eprintln!("failed to query daemon status: {error}");
                std::process::exit(1);
            }
        }
    });

    Ok(())
}

/// Resolve the process-level master key from `DISPATCHD_MASTER_KEY` (64 hex
/// characters = 32 bytes). Generated fresh and logged once if absent, since a
/// from-scratch instance has no organizations to decrypt yet.
fn resolve_master_key() -> anyhow::Result<dispatchd::crypto::MasterKey> {
    match std::env::var("DISPATCHD_MASTER_KEY") {
        Ok(hex_key) => {
            let bytes = hex::decode(hex_key.trim()).context("DISPATCHD_MASTER_KEY must be hex-encoded")?;
            let bytes: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("DISPATCHD_MASTER_KEY must decode to exactly 32 bytes"))?;
            Ok(dispatchd::crypto::MasterKey::from_bytes(&bytes))
        }
        Err(_) => {
            use rand::RngCore as _;
            let mut bytes = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut bytes);
            tracing::warn!(
                "DISPATCHD_MASTER_KEY not set, generated an ephemeral key — organization secrets \
                 encrypted this run will not decrypt after restart"
            );
            Ok(dispatchd::crypto::MasterKey::from_bytes(&bytes))
        }
    }
}

async fn run(
    config: dispatchd::config::Config,
    foreground: bool,
    otel_provider: Option<opentelemetry_sdk::trace::SdkTracerProvider>,
) -> anyhow::Result<()> {
    let paths = dispatchd::daemon::DaemonPaths::new(&config.data_dir);

    tracing::info!("starting dispatchd");
    tracing::info!(data_dir = %config.data_dir.display(), "configuration loaded");

    let (mut shutdown_rx, _ipc_handle) = dispatchd::daemon::start_ipc_server(&paths)
        .await
        .context("failed to start IPC server")?;

    let pool = dispatchd::db::connect(&config.sqlite_path())
        .await
        .context("failed to connect to database")?;

    let tx = dispatchd::db::TransactionManager::new(pool.clone());
    let agents_repo = dispatchd::db::agents::AgentRepo::new(pool.clone());
    let assignments_repo = dispatchd::db::assignments::AssignmentRepo::new(pool.clone());
    let channels_repo = dispatchd::db::channels::ChannelRepo::new(pool.clone());
    let costs_repo = dispatchd::db::conversation_cost::ConversationCostRepo::new(pool.clone());
    let jobs_repo = dispatchd::db::jobs::JobRepo::new(pool.clone());
    let leases_repo = dispatchd::db::leases::LeaseRepo::new(pool.clone());
    let messages_repo = dispatchd::db::messages::MessageRepo::new(pool.clone());
    let organizations_repo = dispatchd::db::organizations::OrganizationRepo::new(pool.clone());
    let users_repo = dispatchd::db::users::UserRepo::new(pool.clone());

    let master_key = resolve_master_key()?;

    let registry = dispatchd::registry::Registry::new(
        agents_repo.clone(),
        assignments_repo.clone(),
        Arc::new(dispatchd::channel::transport::ConnectionSet::new()),
    );

    let channel = dispatchd::channel::MessageChannel::new(
        registry.clone(),
        organizations_repo.clone(),
        master_key,
        config.channel,
    );

    let mut chat_manager = dispatchd::chat::ChatAdapterManager::new();
    let slack = match &config.chat.slack_bot_token {
        Some(token) => {
            let adapter = Arc::new(dispatchd::chat::slack::SlackAdapter::new(token.clone()).context("failed to build slack adapter")?);
            chat_manager.register(adapter.clone());
            Some(adapter)
        }
        None => None,
    };
    let discord = config.chat.discord_bot_token.as_ref().map(|token| {
        let adapter = Arc::new(dispatchd::chat::discord::DiscordAdapter::new(token));
        chat_manager.register(adapter.clone());
        adapter
    });

    let statemachine = dispatchd::statemachine::StateMachine::new(
        tx,
        jobs_repo.clone(),
        messages_repo,
        assignments_repo,
        agents_repo.clone(),
        users_repo,
        channels_repo,
        costs_repo,
        registry.clone(),
        channel.clone(),
        chat_manager,
    );

    let dispatcher = dispatchd::dispatcher::Dispatcher::new(
        dispatchd::db::TransactionManager::new(pool.clone()),
        leases_repo,
        jobs_repo.clone(),
        registry,
        statemachine.clone(),
        channel.clone(),
        config.dispatcher,
    );

    let cancel = tokio_util::sync::CancellationToken::new();
    let _dispatcher_handle = dispatcher.spawn(cancel.clone());
    let _retry_sweep_handle = channel.spawn_retry_sweep(cancel.clone());

    // Chat-event pump: every inbound event off a registered adapter's stream
    // is attributed to this process's single configured organization.
    let mut chat_pump_handles = Vec::new();
    if let Some(org_id) = config.chat.default_org_id.clone() {
        if let Some(slack) = &slack {
            chat_pump_handles.push(spawn_chat_pump(slack.clone(), statemachine.clone(), org_id.clone()));
        }
        if let Some(discord) = &discord {
            chat_pump_handles.push(spawn_chat_pump(discord.clone(), statemachine.clone(), org_id.clone()));
        }
    } else if slack.is_some() || discord.is_some() {
        tracing::warn!("chat adapter configured but DISPATCHD_ORG_ID is unset; inbound events will not be ingested");
    }

    let app_state = Arc::new(dispatchd::api::AppState {
        organizations: organizations_repo,
        jobs: jobs_repo,
        agents: agents_repo,
        channel,
        frame_handler: Arc::new(statemachine),
        slack,
        slack_signing_secret: config.chat.slack_signing_secret.clone(),
        discord,
        discord_public_key: config.chat.discord_public_key.clone(),
    });

    let _http_handle = dispatchd::api::start_http_server(config.http_bind, app_state, shutdown_rx.clone())
        .await
        .context("failed to start HTTP server")?;

    #[cfg(feature = "metrics")]
    let _metrics_handle = if config.metrics.enabled {
        Some(
            dispatchd::telemetry::start_metrics_server(&config.metrics, shutdown_rx.clone())
                .await
                .context("failed to start metrics server")?,
        )
    } else {
        None
    };

    if foreground {
        eprintln!("dispatchd running in foreground (pid {})", std::process::id());
    } else {
        tracing::info!(pid = std::process::id(), "dispatchd daemon started");
    }

    tokio::select! {
        _ = shutdown_rx.wait_for(|shutdown| *shutdown) => {
            tracing::info!("shutdown signal received via IPC");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    cancel.cancel();
    tracing::info!("dispatchd stopped");

    if let Some(provider) = otel_provider
        && let Err(error) = provider.shutdown()
    {
        tracing::warn!(%error, "failed to flush OTel spans on shutdown");
    }

    dispatchd::daemon::cleanup(&paths);

    Ok(())
}

/// Spawn a task reading one adapter's inbound event stream and feeding every
/// event into the state machine under `org_id`.
fn spawn_chat_pump<A>(adapter: Arc<A>, statemachine: dispatchd::statemachine::StateMachine, org_id: String) -> tokio::task::JoinHandle<()>
where
    A: dispatchd::chat::ChatAdapter + 'static,
{
    tokio::spawn(async move {
        use futures::StreamExt as _;

        let mut stream = match adapter.start().await {
            Ok(stream) => stream,
            Err(error) => {
                tracing::error!(%error, "failed to start chat adapter event stream");
                return;
            }
        };

        while let Some(event) = stream.next().await {
            if let Err(error) = statemachine.handle_inbound_event(&org_id, event).await {
                tracing::warn!(%error, "failed to ingest inbound chat event");
            }
        }
    })
}
