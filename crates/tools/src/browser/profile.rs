//! Ephemeral user-data directories for launched browsers.

use serde_json::{json, Value};
use sisypho_core::{Error, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

const TEMP_PREFIX: &str = "sisypho_chrome_";

/// Files carried over from the real profile: identity, nothing else.
pub const PROFILE_FILES: &[&str] = &[
    "Cookies",
    "Login Data",
    "Web Data",
    "History",
    "Bookmarks",
    "Preferences",
];

/// A temporary user-data directory, removed on `remove` or drop.
pub struct EphemeralProfile {
    dir: TempDir,
    cloned: bool,
}

impl EphemeralProfile {
    /// Empty directory, no profile continuity.
    pub fn scratch() -> Result<Self> {
        let dir = tempfile::Builder::new().prefix(TEMP_PREFIX).tempdir()?;
        Ok(Self { dir, cloned: false })
    }

    /// Copy the allow-listed files of `source` into `<tmp>/Default` and replace the
    /// preferences with launch-safe defaults.
    pub fn clone_from(source: &Path) -> Result<Self> {
        if !source.is_dir() {
            return Err(Error::NotFound(format!(
                "profile directory {}",
                source.display()
            )));
        }
        let dir = tempfile::Builder::new().prefix(TEMP_PREFIX).tempdir()?;
        let target = dir.path().join("Default");
        std::fs::create_dir_all(&target)?;

        let mut copied = 0;
        for name in PROFILE_FILES {
            let from = source.join(name);
            if !from.is_file() {
                continue;
            }
            match std::fs::copy(&from, target.join(name)) {
                Ok(_) => copied += 1,
                // A locked cookie store should not sink the whole clone.
                Err(e) => warn!(file = *name, error = %e, "Could not copy profile file"),
            }
        }
        let prefs = serde_json::to_string_pretty(&debug_safe_preferences())?;
        std::fs::write(target.join("Preferences"), prefs)?;
        debug!(source = %source.display(), copied, "Cloned browser profile");

        Ok(Self { dir, cloned: true })
    }

    /// Value for `--user-data-dir`.
    pub fn user_data_dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn profile_path(&self) -> PathBuf {
        self.dir.path().join("Default")
    }

    pub fn is_clone(&self) -> bool {
        self.cloned
    }

    pub fn remove(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove temporary profile");
        } else {
            debug!(path = %path.display(), "Removed temporary profile");
        }
    }
}

/// Preferences that keep a cloned profile from prompting or restoring the user's tabs.
pub fn debug_safe_preferences() -> Value {
    json!({
        "profile": {
            "default_content_setting_values": {
                "notifications": 2,
                "popups": 2
            }
        },
        "browser": {
            "check_default_browser": false,
            "show_home_button": false
        },
        "distribution": {
            "make_chrome_default_for_user": false,
            "system_level": false
        },
        "first_run_tabs": [],
        "homepage_is_newtabpage": true,
        "session": {
            "restore_on_startup": 1
        }
    })
}
