//! HTTP server command: `promptreel serve`.

use std::path::PathBuf;

use anyhow::Result;
use promptreel::config::StudioToml;
use promptreel::server::{ServerConfig, start_server};

/// Flags that override the loaded configuration.
pub struct ServeOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
}

pub async fn cmd_serve(mut config: StudioToml, overrides: ServeOverrides) -> Result<()> {
    if let Some(host) = overrides.host {
        config.server.host = host;
    }
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if let Some(db_path) = overrides.db_path {
        config.server.db_path = db_path;
    }
    if overrides.dev {
        config.server.dev_mode = true;
    }

    start_server(ServerConfig::from(&config), &config).await
}
