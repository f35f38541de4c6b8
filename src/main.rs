use clap::Parser;

use hermod::config::{Cli, Config};
use hermod::hlog;
use hermod::server::{app, AppState};
use hermod::storage::Storage;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = Config::from_cli_and_env(cli);

    hermod::logging::init();

    hlog!("hermod starting");
    hlog!("  database: {}", config.db_path.display());

    let storage = Storage::open(&config.db_path)
        .unwrap_or_else(|error| panic!("failed to open {}: {error}", config.db_path.display()));

    let state = AppState::new(storage);
    let app = app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .unwrap_or_else(|error| panic!("failed to bind {}: {error}", config.bind_addr));
    hlog!("hermod listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .await
        .unwrap_or_else(|error| panic!("server error: {error}"));
}
