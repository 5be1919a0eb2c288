use serde_json::{Map as JsonMap, Value};
use sisypho_core::config::SkillsConfig;
use sisypho_core::Result;
use sisypho_tools::capabilities::Capabilities;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::crypto::SkillCipher;
use crate::engine::{EngineConfig, RunOutcome, SkillSandbox};

/// What happened to one skill execution.
#[derive(Debug, Clone, PartialEq)]
pub enum SkillReport {
    Completed(Value),
    /// The payload did not open in the current time window.
    NothingToExecute,
    TimedOut,
    Failed(String),
}

impl SkillReport {
    pub fn is_success(&self) -> bool {
        matches!(self, SkillReport::Completed(_) | SkillReport::NothingToExecute)
    }
}

/// Decrypts payloads and runs them in a sandbox.
pub struct SkillRunner {
    cipher: SkillCipher,
    sandbox: SkillSandbox,
    timeout: Duration,
    stop_on_failure: bool,
}

impl SkillRunner {
    pub fn new(cipher: SkillCipher, sandbox: SkillSandbox) -> Self {
        Self {
            cipher,
            sandbox,
            timeout: Duration::from_millis(25_000),
            stop_on_failure: false,
        }
    }

    pub fn from_config(config: &SkillsConfig, capabilities: Capabilities) -> Result<Self> {
        let cipher = SkillCipher::from_config(config)?;
        let sandbox = SkillSandbox::new(EngineConfig::from(config), capabilities);
        Ok(Self::new(cipher, sandbox)
            .with_timeout(Duration::from_millis(config.timeout_ms))
            .with_stop_on_failure(config.stop_on_failure))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_stop_on_failure(mut self, stop_on_failure: bool) -> Self {
        self.stop_on_failure = stop_on_failure;
        self
    }

    pub fn sandbox(&self) -> &SkillSandbox {
        &self.sandbox
    }

    pub async fn execute(&self, payload: &str, params: &JsonMap<String, Value>) -> SkillReport {
        self.execute_at(payload, params, chrono::Utc::now().timestamp()).await
    }

    /// Like `execute`, with an explicit clock.
    pub async fn execute_at(&self, payload: &str, params: &JsonMap<String, Value>, timestamp: i64) -> SkillReport {
        let Some(source) = self.cipher.decrypt(payload, timestamp) else {
            if self.stop_on_failure {
                error!("Skill payload could not be decrypted");
                return SkillReport::Failed("payload could not be decrypted".to_string());
            }
            warn!("Skill payload could not be decrypted, nothing to execute");
            return SkillReport::NothingToExecute;
        };
        self.execute_plain(&source, params).await
    }

    /// Run already-decrypted source.
    pub async fn execute_plain(&self, source: &str, params: &JsonMap<String, Value>) -> SkillReport {
        match self.sandbox.run(source, params, self.timeout).await {
            Ok(RunOutcome::Completed(Value::Bool(false))) if self.stop_on_failure => {
                error!("Skill reported failure");
                SkillReport::Failed("skill returned false".to_string())
            }
            Ok(RunOutcome::Completed(value)) => {
                info!(result = %value, "Skill completed");
                SkillReport::Completed(value)
            }
            Ok(RunOutcome::TimedOut) => SkillReport::TimedOut,
            Err(e) => {
                error!(error = %e, "Skill failed");
                SkillReport::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::bare_capabilities;
    use serde_json::json;

    const T: i64 = 1_700_000_010;

    fn runner(dir: &std::path::Path) -> SkillRunner {
        let cipher = SkillCipher::new("somestupidsecret").unwrap();
        let sandbox = SkillSandbox::new(EngineConfig::default(), bare_capabilities(dir));
        SkillRunner::new(cipher, sandbox).with_timeout(Duration::from_secs(5))
    }

    fn seal(source: &str) -> String {
        SkillCipher::new("somestupidsecret").unwrap().encrypt(source, T).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_encrypted_payload_runs() {
        let dir = tempfile::tempdir().unwrap();
        let payload = seal("fn run(n) { n * 2 }");
        let report = runner(dir.path())
            .execute_at(&payload, json!({"n": 21}).as_object().unwrap(), T + 40)
            .await;
        assert_eq!(report, SkillReport::Completed(json!(42)));
        assert!(report.is_success());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_undecryptable_payload_depends_on_policy() {
        let dir = tempfile::tempdir().unwrap();
        let payload = seal("fn run() { true }");
        let lenient = runner(dir.path()).execute_at(&payload, &JsonMap::new(), T + 3600).await;
        assert_eq!(lenient, SkillReport::NothingToExecute);
        assert!(lenient.is_success());

        let strict = runner(dir.path())
            .with_stop_on_failure(true)
            .execute_at(&payload, &JsonMap::new(), T + 3600)
            .await;
        assert!(matches!(strict, SkillReport::Failed(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_false_result_depends_on_policy() {
        let dir = tempfile::tempdir().unwrap();
        let src = "fn run() { false }";
        assert_eq!(
            runner(dir.path()).execute_plain(src, &JsonMap::new()).await,
            SkillReport::Completed(json!(false))
        );
        let strict = runner(dir.path())
            .with_stop_on_failure(true)
            .execute_plain(src, &JsonMap::new())
            .await;
        assert!(!strict.is_success());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_errors_and_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let missing = runner(dir.path()).execute_plain("fn start() { 1 }", &JsonMap::new()).await;
        assert!(matches!(missing, SkillReport::Failed(ref m) if m.contains("run")));

        let slow = runner(dir.path())
            .with_timeout(Duration::from_millis(100))
            .execute_plain("fn run() { loop {} }", &JsonMap::new())
            .await;
        assert_eq!(slow, SkillReport::TimedOut);
        assert!(!slow.is_success());
    }

    #[test]
    fn test_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = SkillsConfig {
            timeout_ms: 1234,
            stop_on_failure: true,
            ..Default::default()
        };
        let r = SkillRunner::from_config(&config, bare_capabilities(dir.path())).unwrap();
        assert_eq!(r.timeout, Duration::from_millis(1234));
        assert!(r.stop_on_failure);

        let bad = SkillsConfig {
            secret: "!!!".into(),
            ..Default::default()
        };
        assert!(SkillRunner::from_config(&bad, bare_capabilities(dir.path())).is_err());
    }
}
