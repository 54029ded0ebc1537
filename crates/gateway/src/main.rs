use std::sync::{Arc, OnceLock};
use std::time::Instant;

use anyhow::Context;
use clap::Parser;

use hearth_bus::EventBus;
use hearth_channels::ChannelMultiplexer;
use hearth_context::ContextManager;
use hearth_domain::config::{Config, ConfigSeverity, ToolProviderConfig};
use hearth_domain::secret::SecretStore;
use hearth_policy::PolicyEngine;
use hearth_providers::catalog::CatalogClient;
use hearth_providers::ProviderRegistry;
use hearth_scheduler::Scheduler;
use hearth_store::Store;
use hearth_tools::builtin::BuiltinProvider;
use hearth_tools::http::HttpProvider;
use hearth_tools::stdio::StdioProvider;
use hearth_tools::{Dispatcher, ToolProvider, ToolRegistry};
use tracing_subscriber::EnvFilter;

use hearth_gateway::api;
use hearth_gateway::devices::DeviceRegistry;
use hearth_gateway::runtime::approval::ApprovalWaiters;
use hearth_gateway::runtime::cancel::CancelMap;
use hearth_gateway::runtime::tasks::{MuxHandler, OrchestratorExecutor};
use hearth_gateway::runtime::workers::SessionWorkers;
use hearth_gateway::secrets::KeyringSecretStore;
use hearth_gateway::state::AppState;

/// Shutdown grace for in-flight workers before forcing exit.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(3);

#[derive(Parser)]
#[command(name = "hearthd", version, about = "Sovereign local-first agent host")]
struct Cli {
    /// Path to the config file.
    #[arg(long, default_value = "hearth.toml")]
    config: std::path::PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the gateway (default).
    Serve,
    /// Stdio JSON-RPC control channel against a running gateway.
    AdminRpc {
        /// Base URL of the running gateway.
        #[arg(long, default_value = "http://127.0.0.1:7171")]
        url: String,
    },
    Version,
}

fn main() {
    // Invalid invocation exits 2 via clap; fatal startup errors exit 1.
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async {
        match cli.command {
            None | Some(Command::Serve) => {
                init_tracing();
                run_server(&cli.config).await
            }
            Some(Command::AdminRpc { url }) => hearth_gateway::admin_rpc::run(&url).await,
            Some(Command::Version) => {
                println!("hearthd {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    });

    if let Err(e) = result {
        eprintln!("fatal: {e:#}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,hearth_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config_path: &std::path::Path) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "hearthd starting");

    // ── Config ───────────────────────────────────────────────────────
    let config = Config::load(config_path).context("loading config")?;
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!("config validation failed");
    }
    let config = Arc::new(config);

    // ── Store (open, migrate, crash-recovery sweep) ──────────────────
    let store = Arc::new(
        Store::open(&config.data_dir, config.limits.max_messages_per_session)
            .context("opening store")?,
    );
    let recovery = store.recover_interrupted().context("recovery sweep")?;
    if !recovery.is_clean() {
        tracing::warn!(
            tool_calls = recovery.interrupted_tool_calls.len(),
            task_runs = recovery.interrupted_task_runs.len(),
            "previous run left interrupted work; records repaired"
        );
    }

    // ── Secrets ──────────────────────────────────────────────────────
    let secrets: Arc<dyn SecretStore> = Arc::new(KeyringSecretStore::new("hearth"));

    // ── Model catalog (fatal when neither endpoint nor cache answers) ─
    let catalog_client = CatalogClient::new(
        &config.catalog.url,
        &config.data_dir,
        std::time::Duration::from_secs(config.catalog.ttl_secs),
    )
    .context("building catalog client")?;
    let catalog = catalog_client.load().await.context("loading model catalog")?;
    tracing::info!(models = catalog.models.len(), "model catalog ready");

    let providers = Arc::new(
        ProviderRegistry::from_config(catalog, &config.llm, secrets.as_ref())
            .context("initializing LLM providers")?,
    );

    // ── Event bus ────────────────────────────────────────────────────
    let bus = Arc::new(EventBus::new(store.clone(), config.bus.queue_capacity));

    // ── Policy engine ────────────────────────────────────────────────
    let policy = Arc::new(PolicyEngine::new(
        store.clone(),
        config.workspace.root.clone(),
        config.limits.requests_per_minute,
        config.limits.tool_calls_per_minute,
        config.orchestrator.approval_timeout_secs,
    ));

    // ── Tool providers ───────────────────────────────────────────────
    let mut tool_providers: Vec<Arc<dyn ToolProvider>> =
        vec![Arc::new(BuiltinProvider::standard())];
    for provider_config in &config.tools.providers {
        match provider_config {
            ToolProviderConfig::Stdio {
                name,
                command,
                args,
            } => {
                tool_providers.push(Arc::new(StdioProvider::new(
                    name.clone(),
                    command.clone(),
                    args.clone(),
                )));
            }
            ToolProviderConfig::Http {
                name,
                url,
                auth_secret_ref,
            } => {
                let token = match auth_secret_ref {
                    Some(reference) => Some(
                        String::from_utf8(secrets.get(reference)?)
                            .context("tool provider auth secret is not UTF-8")?,
                    ),
                    None => None,
                };
                tool_providers.push(Arc::new(
                    HttpProvider::new(name.clone(), url, token)
                        .context("building HTTP tool provider")?,
                ));
            }
        }
    }
    let registry = Arc::new(ToolRegistry::new(tool_providers));
    registry.refresh_all().await;
    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        config.tools.max_concurrent_per_provider,
        std::time::Duration::from_secs(config.tools.default_timeout_secs),
    ));

    // ── Context manager ──────────────────────────────────────────────
    let context = Arc::new(ContextManager::new(store.clone(), config.context.clone()));

    // ── App state ────────────────────────────────────────────────────
    let api_token_hash = api::auth::token_hash_from_env(&config.server.api_token_env);
    let state = AppState {
        config: config.clone(),
        store: store.clone(),
        bus: bus.clone(),
        policy,
        approvals: Arc::new(ApprovalWaiters::new()),
        cancels: Arc::new(CancelMap::new()),
        providers,
        context,
        llm_slots: Arc::new(tokio::sync::Semaphore::new(
            config.limits.max_inflight_provider_calls.max(1),
        )),
        dispatcher,
        workers: Arc::new(SessionWorkers::new()),
        devices: Arc::new(DeviceRegistry::new()),
        mux: Arc::new(OnceLock::new()),
        scheduler: Arc::new(OnceLock::new()),
        webhooks: Arc::new(parking_lot::RwLock::new(Default::default())),
        secrets,
        api_token_hash,
        started_at: Instant::now(),
    };

    // ── Channel multiplexer + stored integrations ────────────────────
    let mux = ChannelMultiplexer::new(
        store.clone(),
        bus.clone(),
        Arc::new(MuxHandler {
            state: state.clone(),
        }),
        60,
        60,
    );
    let _ = state.mux.set(mux);
    for integration in store.list_integrations()? {
        if integration.enabled {
            if let Err(e) = api::integrations::start_integration(&state, &integration).await {
                tracing::warn!(
                    integration = %integration.id,
                    error = %e,
                    "integration failed to start"
                );
            }
        }
    }

    // ── Scheduler ────────────────────────────────────────────────────
    let scheduler = Scheduler::new(
        store.clone(),
        bus.clone(),
        Arc::new(OrchestratorExecutor {
            state: state.clone(),
        }),
        config.scheduler.clone(),
    );
    let scheduler_handles = scheduler.start().await.context("starting scheduler")?;
    let _ = state.scheduler.set(scheduler.clone());

    // ── Idle-session archival sweep ──────────────────────────────────
    let idle_sweep = config.orchestrator.idle_archive_hours.map(|hours| {
        let store = store.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(std::time::Duration::from_secs(600));
            loop {
                tick.tick().await;
                let cutoff = chrono::Utc::now() - chrono::Duration::hours(hours as i64);
                match store.archive_idle_sessions(cutoff) {
                    Ok(archived) if !archived.is_empty() => {
                        tracing::info!(count = archived.len(), "archived idle sessions");
                    }
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "idle archival sweep failed"),
                }
            }
        })
    });

    // ── HTTP surface ─────────────────────────────────────────────────
    let app = api::router(state.clone()).with_state(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.server.listen)
        .await
        .with_context(|| format!("binding {}", config.server.listen))?;
    tracing::info!(listen = %config.server.listen, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving")?;

    // ── Shutdown ─────────────────────────────────────────────────────
    tracing::info!("shutting down");
    if let Some(sweep) = idle_sweep {
        sweep.abort();
    }
    scheduler.stop();
    for handle in scheduler_handles {
        handle.abort();
    }
    if let Some(mux) = state.mux.get() {
        mux.stop_all().await;
    }
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    state.workers.abort_all();
    state.dispatcher.registry().shutdown().await.ok();

    tracing::info!("clean shutdown");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("interrupt received");
}
