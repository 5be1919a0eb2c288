use sisypho_core::{Config, Paths};
use sisypho_tools::{BackendRegistry, Recorder};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

/// Poll the capture tools until Ctrl-C.
pub async fn run(output_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let output_dir = output_dir.unwrap_or_else(|| {
        paths.recording_session_dir(&chrono::Local::now().format("%Y%m%d_%H%M%S").to_string())
    });

    let registry = BackendRegistry::from_config(&config, &paths).into_shared();
    let recorder = Arc::new(Recorder::new(Arc::new(registry.clone()), output_dir, &config.recording));
    println!("Recording to {} (Ctrl-C to stop)", recorder.recording_file().display());

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(recorder.clone().run_loop(shutdown_rx));

    // The loop can also end on its own when the browser bridge goes away
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping recorder...");
            let _ = shutdown_tx.send(());
        }
    });

    let summary = handle.await??;
    registry.lock().await.cleanup().await;
    println!(
        "Wrote {} events over {} polls to {}",
        summary.events_written,
        summary.polls,
        summary.file.display()
    );
    Ok(())
}
