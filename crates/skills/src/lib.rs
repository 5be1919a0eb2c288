pub mod crypto;
pub mod engine;
pub mod namespace;
pub mod runner;

pub use crypto::SkillCipher;
pub use engine::{EngineConfig, RunOutcome, SkillSandbox, ENTRY_POINT};
pub use runner::{SkillReport, SkillRunner};
