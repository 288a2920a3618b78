//! Credential sources for the client store and the device token.
//!
//! The store asks for a token on every connect attempt, so `tether login`
//! (which rewrites the file) takes effect on the next reconnect.

use anyhow::Result;
use std::path::{Path, PathBuf};

/// Where a connection gets its credential from.
pub trait CredentialStore: Send + Sync {
    /// The current credential, or `None` when not logged in.
    fn token(&self) -> Option<String>;
}

/// A fixed credential (from config or env).
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl CredentialStore for StaticToken {
    fn token(&self) -> Option<String> {
        self.0
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }
}

/// Plain-text token file; whitespace is trimmed and an empty file counts as absent.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    path: PathBuf,
}

impl FileTokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Option<String> {
        let s = std::fs::read_to_string(&self.path).ok()?;
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    }

    /// Write the token, creating parent dirs if needed.
    pub fn save(&self, token: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, token.trim())?;
        Ok(())
    }

    /// Remove the token file. Missing file is not an error.
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl CredentialStore for FileTokenStore {
    fn token(&self) -> Option<String> {
        self.load()
    }
}
