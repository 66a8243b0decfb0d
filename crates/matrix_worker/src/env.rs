//! Process environment access with dotenv-style file loading.
//!
//! On first use, `.env` and then `init.env` are read from the working
//! directory and exported into the process environment. After that, every
//! lookup reads the live process env unconditionally, so variables exported
//! by the shell always win over file contents loaded earlier.

use once_cell::sync::Lazy;
use std::path::Path;
use tracing::debug;

static LOAD_ENV_FILES: Lazy<()> = Lazy::new(|| {
    for file in [".env", "init.env"] {
        load_env_file(Path::new(file));
    }
});

/// Read an environment variable, loading the env files once beforehand.
pub fn get_env(key: &str) -> Option<String> {
    Lazy::force(&LOAD_ENV_FILES);
    std::env::var(key).ok()
}

/// Like [`get_env`] with a fallback.
pub fn get_env_or(key: &str, default: &str) -> String {
    get_env(key).unwrap_or_else(|| default.to_string())
}

fn load_env_file(path: &Path) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };
    debug!("Loading env file: {}", path.display());

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"').trim_matches('\'');
        if !key.is_empty() {
            std::env::set_var(key, value);
        }
    }
}
