//! pipeline-collab server binary.
//!
//! Configured from `COLLAB_PORT`, `COLLAB_PERSISTENCE` and
//! `COLLAB_STORAGE_PATH`; log verbosity from `RUST_LOG`.

use pipeline_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };

    let server = SyncServer::new(config)?;
    server.run().await?;
    Ok(())
}
