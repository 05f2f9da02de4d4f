use std::sync::Arc;

use sync_server::config::Settings;
use sync_server::llm::http::HttpLlmClient;
use sync_server::provider::http::HttpProvider;
use sync_server::{db, init_logger, run_until_shutdown};

#[tokio::main]
async fn main() {
    init_logger();

    log::info!("starting inbox sync server");

    let settings = Settings::from_env();

    let pool = match db::connect_pool(&settings.database_url).await {
        Ok(pool) => pool,
        Err(e) => {
            log::error!("failed to connect to database: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = db::run_migrations(&pool).await {
        log::error!("database migrations failed: {}", e);
        std::process::exit(1);
    }

    let http = reqwest::Client::new();
    let provider = Arc::new(HttpProvider::new(&settings.provider, http.clone()));
    let llm = Arc::new(HttpLlmClient::new(&settings.llm, http));

    run_until_shutdown(pool, settings, provider, llm).await;

    log::info!("inbox sync server stopped");
}
