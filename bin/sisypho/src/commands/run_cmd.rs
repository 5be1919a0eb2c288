use sisypho_core::{Config, Paths};
use sisypho_skills::{SkillReport, SkillRunner};
use sisypho_tools::Capabilities;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Execute a skill file, then stop every backend and the browser.
pub async fn run(
    skill: &Path,
    params: Option<&str>,
    stop_on_failure: bool,
    timeout_ms: Option<u64>,
    plain: bool,
) -> anyhow::Result<()> {
    let params = super::parse_object(params)?;
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let text = tokio::fs::read_to_string(skill).await?;

    let capabilities = Capabilities::from_config(&config, &paths);
    let mut runner = SkillRunner::from_config(&config.skills, capabilities.clone())?
        .with_stop_on_failure(stop_on_failure || config.skills.stop_on_failure);
    if let Some(ms) = timeout_ms {
        runner = runner.with_timeout(Duration::from_millis(ms));
    }

    info!(skill = %skill.display(), plain, "Running skill");
    let report = if plain {
        runner.execute_plain(&text, &params).await
    } else {
        runner.execute(text.trim(), &params).await
    };
    capabilities.shutdown().await;

    match report {
        SkillReport::Completed(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        SkillReport::NothingToExecute => {
            println!("Nothing to execute: the payload did not open in the current time window.");
            Ok(())
        }
        SkillReport::TimedOut => anyhow::bail!("Skill timed out"),
        SkillReport::Failed(reason) => anyhow::bail!("Skill failed: {}", reason),
    }
}
