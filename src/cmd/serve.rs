//! Long-running service.

use anyhow::{Context, Result};
use tracing::{info, warn};

use repopilot::config::Settings;
use repopilot::engine::{Engine, SHUTDOWN_GRACE};
use repopilot::git::Git;
use repopilot::registry;

pub async fn cmd_serve(settings: Settings) -> Result<()> {
    let mut engine = Engine::open(settings)?;
    let git = Git::new(&engine.settings().git_cmd);
    match registry::rescan(engine.store(), &git, &engine.settings().repos_dir).await {
        Ok(repos) => info!(repos = repos.len(), "Repository registry loaded"),
        Err(e) => warn!(error = ?e, "Repository scan failed, continuing with stored repositories"),
    }

    let recovered = engine.start().await?;
    println!();
    println!("repopilot serving {}", engine.settings().root.display());
    println!("  workers:   {}", engine.settings().workers);
    println!("  state:     {}", engine.settings().state_dir.display());
    println!("  recovered: {recovered}");
    println!();
    println!("Press Ctrl-C to stop.");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    engine.stop(SHUTDOWN_GRACE).await;
    Ok(())
}
