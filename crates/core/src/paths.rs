use std::path::PathBuf;

/// Environment variable that relocates the accessibility driver in packaged builds.
pub const RESOURCES_ENV: &str = "RESOURCES_PATH";

const ACCESSIBILITY_SERVER_BIN: &str = "AccessibilityMCPServer";

#[derive(Debug, Clone)]
pub struct Paths {
    pub base: PathBuf,
}

impl Paths {
    pub fn new() -> Self {
        let base = dirs::home_dir()
            .map(|h| h.join(".sisypho"))
            .unwrap_or_else(|| PathBuf::from(".sisypho"));
        Self { base }
    }

    pub fn with_base(base: PathBuf) -> Self {
        Self { base }
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn skills_dir(&self) -> PathBuf {
        self.base.join("skills")
    }

    pub fn recordings_dir(&self) -> PathBuf {
        self.base.join("recordings")
    }

    pub fn recording_session_dir(&self, stamp: &str) -> PathBuf {
        self.recordings_dir().join(stamp)
    }

    pub fn workbooks_dir(&self) -> PathBuf {
        self.base.join("workbooks")
    }

    /// Where a bundled fallback browser is unpacked.
    pub fn browsers_dir(&self) -> PathBuf {
        self.base.join("browsers")
    }

    /// Locate the accessibility driver executable.
    ///
    /// A packaged deployment sets `RESOURCES_PATH`; a source checkout has the
    /// driver under one of the swift build directories.
    pub fn accessibility_server(&self) -> PathBuf {
        if let Ok(resources) = std::env::var(RESOURCES_ENV) {
            if !resources.is_empty() {
                return PathBuf::from(resources).join(ACCESSIBILITY_SERVER_BIN);
            }
        }

        let servers_root = std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join("integrations")
            .join("macos")
            .join("servers");
        accessibility_server_in(&servers_root)
    }

    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.skills_dir())?;
        std::fs::create_dir_all(self.recordings_dir())?;
        std::fs::create_dir_all(self.workbooks_dir())?;
        Ok(())
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

/// First existing build output under `servers_root`, else the generic release path.
fn accessibility_server_in(servers_root: &std::path::Path) -> PathBuf {
    let candidates = [
        ".build/arm64-apple-macosx/release",
        ".build/x86_64-apple-macosx/release",
        ".build/release",
    ];
    for dir in candidates {
        let candidate = servers_root.join(dir).join(ACCESSIBILITY_SERVER_BIN);
        if candidate.exists() {
            return candidate;
        }
    }
    servers_root
        .join(".build/release")
        .join(ACCESSIBILITY_SERVER_BIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_under_base() {
        let paths = Paths::with_base(PathBuf::from("/tmp/sisypho-test"));
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/sisypho-test/config.json"));
        assert_eq!(
            paths.recording_session_dir("20240101_120000"),
            PathBuf::from("/tmp/sisypho-test/recordings/20240101_120000")
        );
    }

    #[test]
    fn test_accessibility_server_prefers_existing_build() {
        let dir = tempfile::tempdir().unwrap();
        let x86 = dir.path().join(".build/x86_64-apple-macosx/release");
        std::fs::create_dir_all(&x86).unwrap();
        std::fs::write(x86.join(ACCESSIBILITY_SERVER_BIN), b"").unwrap();

        let found = accessibility_server_in(dir.path());
        assert_eq!(found, x86.join(ACCESSIBILITY_SERVER_BIN));
    }

    #[test]
    fn test_accessibility_server_falls_back_to_release() {
        let dir = tempfile::tempdir().unwrap();
        let found = accessibility_server_in(dir.path());
        assert_eq!(
            found,
            dir.path().join(".build/release").join(ACCESSIBILITY_SERVER_BIN)
        );
    }
}
