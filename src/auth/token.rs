use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::robinhood::OAuthTokens;

/// What gets persisted between runs: a stable device id, and the last
/// session granted to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenFile {
    pub device_token: String,
    #[serde(default)]
    pub session: Option<StoredSession>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSession {
    #[serde(flatten)]
    pub tokens: OAuthTokens,
    pub saved_at: DateTime<Utc>,
}

impl TokenFile {
    /// A fresh device id with no session yet.
    pub fn new_device() -> Self {
        TokenFile {
            device_token: uuid::Uuid::new_v4().to_string(),
            session: None,
        }
    }

    pub fn with_session(mut self, tokens: OAuthTokens) -> Self {
        self.session = Some(StoredSession {
            tokens,
            saved_at: Utc::now(),
        });
        self
    }
}

/// Reads and writes the token file at a fixed path.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TokenStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the token file, or `None` if it doesn't exist yet.
    pub fn load(&self) -> Result<Option<TokenFile>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading token file {}", self.path.display()))?;
        let file: TokenFile = serde_json::from_str(&contents)
            .with_context(|| format!("parsing token file {}", self.path.display()))?;
        Ok(Some(file))
    }

    /// Load the token file, or mint a new device id.
    pub fn load_or_new(&self) -> Result<TokenFile> {
        Ok(self.load()?.unwrap_or_else(TokenFile::new_device))
    }

    /// Save atomically (tmp + rename), creating parent dirs. Owner-only on Unix.
    pub fn save(&self, file: &TokenFile) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating token dir {}", parent.display()))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(file)?;
        // A leftover tmp from a crashed save may carry looser permissions.
        match std::fs::remove_file(&tmp) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
                return Err(e)
                    .with_context(|| format!("removing stale token tmp {}", tmp.display()));
            }
            _ => {}
        }
        let mut out = create_private(&tmp)?;
        out.write_all(json.as_bytes())
            .and_then(|()| out.sync_all())
            .with_context(|| format!("writing token tmp {}", tmp.display()))?;
        drop(out);
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming token tmp -> {}", self.path.display()))?;
        Ok(())
    }

    /// Drop the cached session but keep the device id.
    pub fn forget_session(&self) -> Result<()> {
        if let Some(mut file) = self.load()? {
            file.session = None;
            self.save(&file)?;
        }
        Ok(())
    }
}

/// New file that only the owner can read, from the moment it exists.
fn create_private(path: &Path) -> Result<File> {
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path)
        .with_context(|| format!("creating token tmp {}", path.display()))
}
