//! opost-hub - campus letter delivery coordination service
//!
//! Single binary hosting the courier hierarchy, signed delivery codes, task
//! dispatch with timeout escalation, and idempotent scan processing.

use anyhow::Result;
use clap::Parser;
use opost_common::auth::load_shared_secret;
use opost_common::config::{database_path, resolve_root_folder, HubSettings};
use opost_common::db::init_database;
use opost_common::events::{EventBus, OpostEvent};
use opost_common::opcode::OpCodeAuthority;
use opost_common::signing::{load_signing_secret, CodeSigner};
use opost_hub::{build_router, sweep, AppState};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "opost-hub", version, about = "Letter delivery coordination hub")]
struct Args {
    /// Root folder holding the database (falls back to OPOST_ROOT_FOLDER,
    /// then the config file, then the OS default)
    #[arg(long)]
    root_folder: Option<String>,

    /// Port to listen on
    #[arg(long, default_value_t = 5780)]
    port: u16,

    /// Base URL of an external address-registry service; when unset, any
    /// well-formed OP code is accepted
    #[arg(long, env = "OPOST_ADDRESS_REGISTRY")]
    address_registry: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    info!("Starting OPost Hub (opost-hub) v{}", env!("CARGO_PKG_VERSION"));

    let root_folder = resolve_root_folder(args.root_folder.as_deref(), "OPOST_ROOT_FOLDER");
    std::fs::create_dir_all(&root_folder)?;
    let db_path = database_path(&root_folder);
    info!("Database path: {}", db_path.display());

    let pool = init_database(&db_path).await?;
    info!("✓ Database initialized");

    let shared_secret = load_shared_secret(&pool).await?;
    if shared_secret == 0 {
        info!("API authentication disabled (shared_secret = 0)");
    } else {
        info!("✓ Loaded shared secret for API authentication");
    }

    let signing_secret = load_signing_secret(&pool).await?;
    let signer = CodeSigner::new(&signing_secret);

    let authority = match args.address_registry {
        Some(url) => {
            info!("Resolving OP codes against {}", url);
            OpCodeAuthority::remote(url)
        }
        None => OpCodeAuthority::Permissive,
    };

    let settings = HubSettings::load(&pool).await?;
    info!(
        code_ttl_hours = settings.code_ttl_hours,
        escalation_deadline_secs = settings.escalation_deadline_secs,
        "✓ Settings loaded"
    );

    let events = EventBus::new(1000);
    spawn_operator_alerts(&events);

    let state = AppState::new(pool, events, signer, authority, shared_secret, settings.clone());

    sweep::spawn_sweeps(
        state.lifecycle.clone(),
        state.dispatcher.clone(),
        settings.escalation_interval_secs.max(1) as u64,
        settings.max_lock_wait_ms,
    );

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", args.port)).await?;
    info!("opost-hub listening on http://127.0.0.1:{}", args.port);
    info!("Health check: http://127.0.0.1:{}/health", args.port);

    axum::serve(listener, app).await?;
    Ok(())
}

/// Mirror operator-facing events into the log so a bare deployment with no
/// external consumers still surfaces security alerts and exhausted tasks.
fn spawn_operator_alerts(events: &EventBus) {
    let mut rx = events.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(OpostEvent::SecurityAlert { code_id, reason, .. }) => {
                    warn!(code_id = %code_id, reason = %reason, "SECURITY ALERT");
                }
                Ok(OpostEvent::TaskFailed { task_id, reason, .. }) => {
                    error!(task_id = %task_id, reason = %reason, "task failed");
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(missed = n, "operator alert subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
