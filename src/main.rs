//! Parley relay server binary.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;

use parley_relay::notify::{HttpPushNotifier, NoopNotifier, PushNotifier};
use parley_relay::store::SqliteStore;
use parley_relay::{app, RelayConfig, RelayState};

/// Upper bound for `PENDING_TTL_DAYS` (100 years).
const MAX_PENDING_TTL_DAYS: i64 = 36_500;

/// Upper bound for `LOCKOUT_SECS` (one day).
const MAX_LOCKOUT_SECS: i64 = 24 * 3600;

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "parley-relay", version, about = "Parley chat relay server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "PORT")]
    port: u16,

    /// SQLite database path (":memory:" for an ephemeral store)
    #[arg(long, default_value = "parley.db", env = "DATABASE_PATH")]
    database_path: String,

    /// Pending message TTL in days
    #[arg(
        long,
        default_value_t = 7,
        env = "PENDING_TTL_DAYS",
        value_parser = clap::value_parser!(i64).range(1..=MAX_PENDING_TTL_DAYS)
    )]
    pending_ttl_days: i64,

    /// Cleanup interval in seconds
    #[arg(long, default_value_t = 300, env = "CLEANUP_INTERVAL_SECS")]
    cleanup_interval_secs: u64,

    /// Keep a permanent archive copy of every message
    #[arg(long, default_value_t = true, env = "ARCHIVE_MESSAGES", action = clap::ArgAction::Set)]
    archive_messages: bool,

    /// Send push notifications to offline recipients with a subscription
    #[arg(long, default_value_t = false, env = "PUSH_NOTIFICATIONS", action = clap::ArgAction::Set)]
    push_notifications: bool,

    /// Push request timeout in seconds
    #[arg(long, default_value_t = 10, env = "PUSH_TIMEOUT_SECS")]
    push_timeout_secs: u64,

    /// Maximum WebSocket message size in bytes
    #[arg(long, default_value_t = 10 * 1024 * 1024, env = "MAX_FRAME_BYTES")]
    max_frame_bytes: usize,

    /// Failed logins before a username is locked
    #[arg(long, default_value_t = 5, env = "LOCKOUT_THRESHOLD")]
    lockout_threshold: u32,

    /// Lock duration in seconds
    #[arg(
        long,
        default_value_t = 60,
        env = "LOCKOUT_SECS",
        value_parser = clap::value_parser!(i64).range(1..=MAX_LOCKOUT_SECS)
    )]
    lockout_secs: i64,

    /// bcrypt cost for new passwords
    #[arg(long, default_value_t = 12, env = "BCRYPT_COST")]
    bcrypt_cost: u32,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false, env = "LOG_JSON")]
    log_json: bool,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "parley_relay=info,tower_http=info".into());
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = RelayConfig {
        port: args.port,
        database_path: args.database_path,
        pending_ttl_secs: args
            .pending_ttl_days
            .checked_mul(24 * 3600)
            .unwrap_or(i64::MAX),
        archive_messages: args.archive_messages,
        max_frame_bytes: args.max_frame_bytes,
        lockout_threshold: args.lockout_threshold,
        lockout_secs: args.lockout_secs,
        bcrypt_cost: args.bcrypt_cost,
    };

    let store = match SqliteStore::open(&config.database_path) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(
                path = config.database_path.as_str(),
                error = %e,
                "Failed to open database"
            );
            std::process::exit(1);
        }
    };
    tracing::info!(path = config.database_path.as_str(), "Database opened");

    let notifier: Arc<dyn PushNotifier> = if args.push_notifications {
        tracing::info!("Push notifications enabled");
        Arc::new(HttpPushNotifier::new(Duration::from_secs(
            args.push_timeout_secs,
        )))
    } else {
        Arc::new(NoopNotifier)
    };

    let state = RelayState::with_sqlite(config, store, notifier);

    // Spawn periodic cleanup task
    let cleanup_state = state.clone();
    let cleanup_interval = args.cleanup_interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(cleanup_interval));
        loop {
            interval.tick().await;
            cleanup_state.cleanup_expired();
        }
    });

    let addr = format!("0.0.0.0:{}", state.config.port);
    let router = app(state);

    tracing::info!("Parley relay server starting on {}", addr);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = addr.as_str(), error = %e, "Failed to bind address");
            std::process::exit(1);
        }
    };

    if let Err(e) = axum::serve(listener, router).await {
        tracing::error!(error = %e, "Server error");
        std::process::exit(1);
    }
}
