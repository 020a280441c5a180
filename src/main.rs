use rag_gateway::{
    config::Config,
    server::{create_router, AppState},
    shutdown::{shutdown_signal, BackgroundTasks},
};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse_args();
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let sweep_interval = Duration::from_secs(config.sweep_interval_seconds);

    let state = AppState::new(config)?;

    let mut tasks = BackgroundTasks::new();
    {
        let cache = Arc::clone(&state.cache);
        let token = tasks.token();
        tasks.register(tokio::spawn(async move {
            cache.run_sweeper(sweep_interval, token).await;
        }));
    }
    {
        let limiter = Arc::clone(&state.limiter);
        let token = tasks.token();
        tasks.register(tokio::spawn(async move {
            limiter.run_sweeper(sweep_interval, token).await;
        }));
    }
    {
        let perf = Arc::clone(&state.perf);
        let token = tasks.token();
        tasks.register(tokio::spawn(async move {
            perf.run_sampler(sweep_interval, token).await;
        }));
    }

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", listener.local_addr()?);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    tasks.shutdown().await;
    info!("server stopped");
    Ok(())
}
