//! Fixtures shared by unit tests.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{RepopilotToml, Settings};

/// Write an executable `#!/bin/sh` script.
pub fn write_script(path: &Path, body: &str) -> PathBuf {
    std::fs::write(path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}

/// Settings rooted at `root` with short timeouts and no ambient credentials
/// or command overrides.
pub fn settings(root: &Path) -> Settings {
    let mut settings = Settings::from_toml(root, &RepopilotToml::default());
    settings.agent_timeout = Duration::from_secs(20);
    settings.cancel_poll = Duration::from_millis(50);
    settings.poll_interval = Duration::from_millis(50);
    settings.test_timeout = Duration::from_secs(20);
    settings.github_token = None;
    settings.claude_cmd = "claude".to_string();
    settings.gh_cmd = "gh".to_string();
    settings
}
