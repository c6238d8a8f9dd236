#[cfg(feature = "ssr")]
#[tokio::main]
async fn main() -> std::process::ExitCode {
    use planning_poker::config::Config;
    use std::process::ExitCode;

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    init_logging(config.log_format);

    match serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server stopped with an error");
            ExitCode::FAILURE
        }
    }
}

#[cfg(feature = "ssr")]
fn init_logging(format: planning_poker::config::LogFormat) {
    use planning_poker::config::LogFormat;
    use tracing_subscriber::EnvFilter;

    // Respects RUST_LOG, defaults to INFO
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Human => builder.init(),
    }
}

#[cfg(feature = "ssr")]
async fn serve(config: planning_poker::config::Config) -> Result<(), Box<dyn std::error::Error>> {
    use planning_poker::app::{router, AppState};
    use planning_poker::events::BroadcastHub;
    use planning_poker::{build_pool, run_migrations};
    use std::sync::Arc;

    let pool = build_pool(&config.database_url, config.pool_size)?;
    {
        let mut conn = pool.get()?;
        run_migrations(&mut conn)?;
    }

    let addr = config.bind_addr;
    tracing::info!(
        %addr,
        auto_reveal = %config.auto_reveal,
        pool_size = config.pool_size,
        "starting planning poker server"
    );

    let state = AppState::new(pool, Arc::new(BroadcastHub::new()), config);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("listening on http://{}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shut down");
    Ok(())
}

#[cfg(feature = "ssr")]
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
}

#[cfg(not(feature = "ssr"))]
pub fn main() {
    // no server without the `ssr` feature; the library still exposes the shared model types
}
