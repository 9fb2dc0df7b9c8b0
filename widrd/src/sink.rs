//! Per-task token sinks.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;
use widr_common::DEFAULT_IDENTITY_NAME;

/// Name of the file holding the default identity's token inside a task's
/// secrets directory.
pub const WI_TOKEN_FILE: &str = "nomad_token";

/// Errors writing a token to a task.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to write token file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("identity name `{0}` cannot be used as a file name")]
    InvalidName(String),

    #[error("token sink unavailable: {0}")]
    Unavailable(String),
}

/// Receives freshly (re)signed tokens for one task.
#[async_trait]
pub trait TaskTokenSink: Send + Sync {
    async fn apply_token(&self, identity: &str, token: &str) -> Result<(), SinkError>;
}

/// Writes tokens into a task-private secrets directory.
///
/// The default identity lands in [`WI_TOKEN_FILE`]; every other identity in
/// `nomad_<name>.jwt`. Files are replaced atomically and are owner-only.
#[derive(Debug, Clone)]
pub struct SecretDirSink {
    dir: PathBuf,
}

impl SecretDirSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path the token for `identity` is written to.
    pub fn token_path(&self, identity: &str) -> Result<PathBuf, SinkError> {
        if identity.is_empty()
            || identity.contains(['/', '\\'])
            || identity.starts_with('.')
        {
            return Err(SinkError::InvalidName(identity.to_string()));
        }
        let file = if identity == DEFAULT_IDENTITY_NAME {
            WI_TOKEN_FILE.to_string()
        } else {
            format!("nomad_{identity}.jwt")
        };
        Ok(self.dir.join(file))
    }
}

/// Create `tmp` owner-only and write `token` into it. Fails if `tmp` exists.
async fn write_new(tmp: &Path, token: &str) -> std::io::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(tmp).await?;
    file.write_all(token.as_bytes()).await?;
    file.sync_all().await
}

#[async_trait]
impl TaskTokenSink for SecretDirSink {
    async fn apply_token(&self, identity: &str, token: &str) -> Result<(), SinkError> {
        let path = self.token_path(identity)?;
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| SinkError::Io { path, source }
        };

        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(io_err(&self.dir))?;

        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        let written = match write_new(&tmp, token).await {
            Ok(()) => tokio::fs::rename(&tmp, &path).await.map_err(io_err(&path)),
            Err(source) => Err(io_err(&tmp)(source)),
        };

        if let Err(err) = written {
            // The temp file holds the token in plaintext.
            if let Err(cleanup) = tokio::fs::remove_file(&tmp).await
                && cleanup.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %tmp.display(), error = %cleanup, "Failed to remove temp token file");
            }
            return Err(err);
        }

        debug!(identity, path = %path.display(), "Wrote workload identity token");
        Ok(())
    }
}
