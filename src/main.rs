use clap::Parser;
use periscope::config::{Args, ModelTable};
use periscope::credentials::CredentialPool;
use periscope::gateway::{ChatGateway, GatewayConfig, LogOnlyRefresh};
use periscope::server::{serve, AppState};
use periscope::stats::UsageStats;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "periscope=debug".into(),
    };

    let file_appender = tracing_appender::rolling::daily(".", "periscope.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .init();

    periscope::logging::setup_panic_hook();

    let args = Arc::new(Args::parse());

    if let Some(parent) = std::path::Path::new(&args.credentials_file).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let pool = Arc::new(
        CredentialPool::load_or_default(&args.credentials_file, args.pool_size).await,
    );
    let stats = Arc::new(UsageStats::load_or_default(&args.stats_file).await);
    let models = Arc::new(ModelTable::load_or_default(&args.models_file).await);

    let gateway_config = GatewayConfig {
        max_retries: args.max_retries,
        auth_statuses: args.auth_statuses(),
        heartbeat_enabled: !args.disable_heartbeat,
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
        ..GatewayConfig::default()
    };
    let gateway = ChatGateway::new(
        pool.clone(),
        stats.clone(),
        models.clone(),
        Arc::new(LogOnlyRefresh),
        gateway_config,
    );

    let state = Arc::new(AppState {
        gateway,
        pool,
        stats,
        models,
        args,
    });

    if let Err(e) = serve(state).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}
