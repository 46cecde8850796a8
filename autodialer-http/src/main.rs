use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use autodialer_blog::BlogStore;
use autodialer_config::DialerConfig;
use autodialer_core::wiring;
use autodialer_http::{build_router, AppState};
use autodialer_scrape::ScrapeRunner;
use autodialer_store::{PhoneStore, SqlitePhoneStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = DialerConfig::load()?;

    let store: Arc<dyn PhoneStore> = Arc::new(SqlitePhoneStore::open(&cfg.storage.database_path)?);
    let engine = wiring::chat_engine(&cfg.llm)?;
    let dialer = wiring::dispatcher(&cfg, store, &engine)?;
    let blog = BlogStore::new(
        &cfg.blog.dir,
        wiring::chat_engine_or_null(&engine),
        Some(cfg.llm.blog_model.clone()),
    );
    let scraper = ScrapeRunner::new(cfg.scrape.clone());

    let app = build_router(AppState {
        dialer: Arc::new(dialer),
        blog: Arc::new(blog),
        scraper: Arc::new(scraper),
    });

    let addr: SocketAddr = cfg.http.bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, db = %cfg.storage.database_path.display(), "autodialer HTTP server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
