use letschat::{app, config::Config, db, AppState};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("letschat=info,tower_http=info"));
    if config.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let db_pool = db::connect(&config.database_url, config.db_max_connections).await?;
    let app_state = AppState::new(db_pool, config.jwt_secret.as_bytes());
    let app = app(app_state, &config.cors_origin)?;

    let addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, version = env!("CARGO_PKG_VERSION"), "letschat listening");

    axum::serve(listener, app).await?;
    Ok(())
}
