//! Binary entrypoint: load configuration, open the database, start the
//! HTTP server and the background maintenance sweep.

use std::time::Duration;

use relay_gateway::{config, db, logger, server::AppState};

#[tokio::main]
async fn main() {
    logger::init();
    db::init();

    let settings = config::load();
    let state = AppState::new(settings);

    let sweep_state = std::sync::Arc::clone(&state);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            ticker.tick().await;
            sweep_state.run_maintenance_sweep().await;
        }
    });

    relay_gateway::server::serve(state).await;
}
