use sisypho_core::{Config, Paths};
use sisypho_skills::SkillCipher;
use std::path::Path;

/// Print a payload sealed for `timestamp` (or now).
pub async fn run(source: &Path, timestamp: Option<i64>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let config = Config::load_or_default(&paths)?;
    let cipher = SkillCipher::from_config(&config.skills)?;

    let text = tokio::fs::read_to_string(source).await?;
    let at = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
    println!("{}", cipher.encrypt(&text, at)?);
    Ok(())
}
