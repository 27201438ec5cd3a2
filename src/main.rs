//! SYNCHUB - Real-Time Collaboration Hub
//!
//! Binary entry point: load configuration from the environment, wire the
//! hub and serve until interrupted.

use synchub::app::HubApp;
use synchub::config::HubConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = HubConfig::from_env()?;
    let app = HubApp::new(config).await?;
    app.run().await
}
