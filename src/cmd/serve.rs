//! `pcc init` and `pcc serve`.

use anyhow::Result;

use pcc::config::PccConfig;

pub fn cmd_init(config: &PccConfig) -> Result<()> {
    pcc::server::init(config)?;
    println!("Initialized pcc");
    println!("  config:    {}", config.config_path.display());
    println!("  database:  {}", config.db_path().display());
    println!("  artifacts: {}", config.artifacts_dir().display());
    Ok(())
}

pub async fn cmd_serve(
    mut config: PccConfig,
    host: Option<String>,
    port: Option<u16>,
) -> Result<()> {
    if let Some(host) = host {
        config.toml.server.host = host;
    }
    if let Some(port) = port {
        config.toml.server.port = port;
    }
    pcc::server::init(&config)?;
    pcc::server::serve(config).await
}
