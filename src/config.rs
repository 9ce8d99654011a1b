use std::path::PathBuf;

use anyhow::{Result, anyhow};

pub const DEFAULT_API_URL: &str = "https://api.robinhood.com";

pub const USERNAME_VAR: &str = "ROBINHOOD_USERNAME";
pub const PASSWORD_VAR: &str = "ROBINHOOD_PASSWORD";
pub const TOKEN_FILE_VAR: &str = "ROBINHOOD_TOKEN_FILE";
pub const API_URL_VAR: &str = "ROBINHOOD_API_URL";

/// Load `.env` from the working directory if present. Variables already set
/// in the environment win.
pub fn load_dotenv() {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "loaded .env"),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!("ignoring unreadable .env: {e}"),
    }
}

/// Brokerage login credentials.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Credentials {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Credentials if both variables are set, `None` otherwise.
    pub fn from_env_opt() -> Option<Self> {
        Self::from_env().ok()
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        match (get(USERNAME_VAR), get(PASSWORD_VAR)) {
            (Some(username), Some(password)) => Ok(Credentials { username, password }),
            _ => Err(anyhow!(
                "{USERNAME_VAR} and {PASSWORD_VAR} must be set (in the environment or a .env file)"
            )),
        }
    }
}

/// Where the device token and session are cached.
pub fn default_token_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tokens")
        .join("robinhood.json")
}

/// Token path from the CLI flag, then the environment, then the default.
pub fn resolve_token_path(flag: Option<PathBuf>) -> PathBuf {
    flag.or_else(|| std::env::var_os(TOKEN_FILE_VAR).map(PathBuf::from))
        .unwrap_or_else(default_token_path)
}

pub fn api_base_url() -> String {
    std::env::var(API_URL_VAR)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string())
}
