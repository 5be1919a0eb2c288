use sisypho_core::{Config, Paths};
use sisypho_tools::BrowserSessionManager;

/// Acquire a session through the tier chain and print its health report.
pub async fn status() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let mut manager = BrowserSessionManager::from_config(&config.browser, &paths);

    let acquired = manager.acquire_session().await.map(|s| s.tier().to_string());
    match acquired {
        Ok(tier) => println!("Acquired browser via {}", tier),
        Err(e) => println!("No browser available: {}", e),
    }
    println!("{}", serde_json::to_string_pretty(&manager.status().await)?);

    manager.release().await;
    Ok(())
}
