use std::path::PathBuf;
use std::sync::Arc;

use inbox_assist::agent::{AgentBackend, CommandAgentBackend};
use inbox_assist::api::{AppState, api_routes};
use inbox_assist::artifacts::DirArtifacts;
use inbox_assist::channels::{CliChannel, MessagingSurface, WebChannel};
use inbox_assist::classifier::PassthroughClassifier;
use inbox_assist::config::{AgentConfig, ChannelKind, QueueConfig};
use inbox_assist::inbox::Inbox;
use inbox_assist::store::{LibSqlBackend, TaskStore};
use inbox_assist::tasks::event_channel;
use inbox_assist::worker::{QueueScheduler, RecoveryCoordinator, TaskExecutor};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = QueueConfig::from_env();
    // Held for the process lifetime so buffered file logs get flushed
    let _log_guard = init_tracing(config.log_dir.clone());
    let agent_config = AgentConfig::from_env();

    eprintln!("📥 Inbox Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Agent: {} {}", agent_config.command, agent_config.args.join(" "));
    eprintln!("   Max concurrent: {}", config.max_concurrent);
    eprintln!("   API: http://0.0.0.0:{}/api/tasks", config.http_port);
    eprintln!("   Events WS: ws://0.0.0.0:{}/ws", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Engine ───────────────────────────────────────────────────────────
    let events = event_channel();

    let backend: Arc<dyn AgentBackend> = Arc::new(
        CommandAgentBackend::new(agent_config.command.clone())
            .with_args(agent_config.args.clone())
            .with_default_dir(agent_config.working_dir.clone()),
    );

    let cli = Arc::new(CliChannel::new());
    let surface: Arc<dyn MessagingSurface> = match config.channel {
        ChannelKind::Cli => cli.clone(),
        ChannelKind::Web => Arc::new(WebChannel::new(events.clone())),
    };
    eprintln!("   Channel: {}", surface.name());

    let mut executor = TaskExecutor::new(
        Arc::clone(&store),
        backend,
        Arc::clone(&surface),
        agent_config,
        events.clone(),
    );
    if let Some(dir) = &config.artifact_dir {
        executor = executor.with_artifacts(Arc::new(DirArtifacts::new(dir, Arc::clone(&surface))));
        eprintln!("   Artifacts: {}", dir.display());
    }
    let scheduler = Arc::new(QueueScheduler::new(Arc::new(executor), config.max_concurrent));

    // ── Startup Recovery ─────────────────────────────────────────────────
    let recovery =
        RecoveryCoordinator::new(Arc::clone(&store), events.clone(), config.recovery_delay);
    let (report, _kick) = recovery.run(&scheduler).await.map_err(|e| {
        tracing::error!(error = %e, "Startup recovery failed");
        e
    })?;
    if !report.recovered.is_empty() {
        eprintln!("   Recovered {} interrupted tasks", report.recovered.len());
    }
    eprintln!("   Queued: {}\n", report.queued);

    let _scheduler_handle = scheduler.spawn();

    let inbox = Arc::new(Inbox::new(
        Arc::new(PassthroughClassifier::default()),
        Arc::clone(&scheduler),
    ));

    // ── HTTP ─────────────────────────────────────────────────────────────
    let app = api_routes(AppState {
        store: Arc::clone(&store),
        inbox: Arc::clone(&inbox),
        scheduler: Arc::clone(&scheduler),
        events: events.clone(),
    });
    let port = config.http_port;
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(port, error = %e, "Failed to bind HTTP port");
                return;
            }
        };
        tracing::info!(port, "HTTP server started");
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "HTTP server stopped");
        }
    });

    // ── Inbound loop ─────────────────────────────────────────────────────
    match config.channel {
        ChannelKind::Cli => {
            eprintln!("   Type a request and press Enter. #<thread> text replies, /reject <thread> rejects.\n");
            let mut inbound = cli.start();
            while let Some(event) = inbound.recv().await {
                let inbox = Arc::clone(&inbox);
                tokio::spawn(async move {
                    inbox.dispatch(event).await;
                });
            }
            tracing::info!("stdin closed, shutting down");
        }
        ChannelKind::Web => {
            tokio::signal::ctrl_c().await?;
            tracing::info!("Interrupted, shutting down");
        }
    }

    Ok(())
}

/// Console logging, plus a daily-rotated file when `log_dir` is set.
fn init_tracing(log_dir: Option<PathBuf>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let console = fmt::layer().with_target(false).with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "inbox-assist.log"));
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_target(false).with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    }
}
