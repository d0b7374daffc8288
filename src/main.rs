use std::sync::Arc;

use anyhow::Context;

use toolhost::config;
use toolhost::logging;
use toolhost::subserver::{host_management_tools, ContainerLauncher, StaticCatalog, SubServerHost};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_path = logging::init_tracing().context("failed to initialize logging")?;
    eprintln!("toolhost: logging to {}", log_path.display());

    let config = config::load().context("failed to load host config")?;

    let launcher = Arc::new(ContainerLauncher::new(&config.runtime));
    let builtins = Arc::new(StaticCatalog::new(host_management_tools()));
    let host = SubServerHost::from_config(&config, launcher, builtins);

    // Partial startup is fine: failed servers stay listed in `error`.
    for (name, err) in host.attach_all(&config.servers).await {
        tracing::error!(server = %name, error = %err, "failed to attach configured server");
        eprintln!("toolhost: server '{name}' failed to attach: {err}");
    }

    let catalog = host.catalog().await;
    let rendered = serde_json::to_string_pretty(&catalog).context("failed to render catalog")?;
    println!("{rendered}");

    let summaries = serde_json::to_string(&host.list().await).context("failed to render server list")?;
    tracing::info!(
        running = host.running_server_count().await,
        tool_count = catalog.len(),
        servers = %summaries,
        "host ready"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("shutting down sub-servers");
    host.shutdown_all().await;
    Ok(())
}
