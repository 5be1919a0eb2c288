use sisypho_core::{Config, Paths};
use sisypho_tools::BackendRegistry;

/// Start every configured backend and list what each one offers.
pub async fn run() -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let mut registry = BackendRegistry::from_config(&config, &paths);

    if registry.is_empty() {
        println!("No backends configured. Add servers under `backends.servers` in {}", paths.config_file().display());
        return Ok(());
    }

    let all_ready = registry.initialize_all().await;
    let tools = registry.all_tools();

    println!();
    for backend in registry.backends() {
        println!("  {} [{}] ({} tools)", backend.name, backend.state, backend.tool_count);
        if let Some(list) = tools.get(&backend.name) {
            for tool in list {
                let short: String = tool.description.chars().take(60).collect();
                let ellipsis = if tool.description.chars().count() > 60 { "..." } else { "" };
                println!("     {:<28} {}{}", tool.name, short, ellipsis);
            }
        }
        println!();
    }
    if !all_ready {
        println!("Some backends failed to start; run with -v for details.");
    }

    registry.cleanup().await;
    Ok(())
}
