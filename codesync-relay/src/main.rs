//! CodeSync relay binary.
//!
//! Usage: `codesync-relay [config.json]`
//!
//! `CODESYNC_BIND` and `CODESYNC_MAX_PARTICIPANTS` override the file.
//! Log level follows `RUST_LOG` (default `info`).

use std::env;
use std::error::Error;
use std::fs;

use codesync_collab::server::{RelayServer, ServerConfig};
use log::info;

fn load_config() -> Result<ServerConfig, Box<dyn Error>> {
    let mut config = match env::args().nth(1) {
        Some(path) => {
            info!("Loading config from {path}");
            serde_json::from_str(&fs::read_to_string(&path)?)?
        }
        None => ServerConfig::default(),
    };

    if let Ok(bind) = env::var("CODESYNC_BIND") {
        config.bind_addr = bind;
    }
    if let Ok(max) = env::var("CODESYNC_MAX_PARTICIPANTS") {
        config.max_participants_per_project = max.parse()?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config()?;
    info!(
        "Starting CodeSync relay on {} (max {} per project)",
        config.bind_addr, config.max_participants_per_project
    );

    let server = RelayServer::new(config);
    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}
