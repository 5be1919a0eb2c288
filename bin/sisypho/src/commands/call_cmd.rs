use sisypho_core::{Config, Paths};
use sisypho_tools::{BackendRegistry, CallOutcome};

/// One capability call, printed as JSON.
pub async fn run(tool: &str, args: Option<&str>, backend: Option<&str>) -> anyhow::Result<()> {
    let arguments = serde_json::Value::Object(super::parse_object(args)?);
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let mut registry = BackendRegistry::from_config(&config, &paths);

    let outcome = registry.call(tool, arguments, backend).await;
    registry.cleanup().await;

    match outcome {
        CallOutcome::Failed(e) => anyhow::bail!("{}", e),
        CallOutcome::NoResult => println!("(no result)"),
        CallOutcome::Payload(payload) => {
            println!("{}", serde_json::to_string_pretty(&payload.into_value())?);
        }
    }
    Ok(())
}
