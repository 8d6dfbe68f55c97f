//! Binary materialization.
//!
//! Planning needs the test binary on local disk. A [`Materializer`] turns a
//! [`BinaryReference`] into a local path, downloading the binary if needed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::MaterializerConfig;
use crate::context::BinaryReference;

/// Result type for materialization.
pub type MaterializeResult<T> = Result<T, MaterializeError>;

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    #[error("Binary reference has neither a local nor a remote path")]
    EmptyReference,

    #[error("Binary not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Cannot download {0}: no download_command configured")]
    NoDownloadCommand(String),

    #[error("Invalid download_command: {0}")]
    InvalidCommand(String),

    #[error("Download of {remote} failed ({status}): {stderr}")]
    DownloadFailed {
        remote: String,
        status: String,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves binary references to local files.
#[async_trait]
pub trait Materializer: Send + Sync {
    /// Returns a local path holding the referenced binary.
    async fn materialize(&self, reference: &BinaryReference) -> MaterializeResult<PathBuf>;
}

/// Builds the materializer described by the configuration.
pub fn from_config(config: &MaterializerConfig) -> Arc<dyn Materializer> {
    match &config.download_command {
        Some(command) => Arc::new(CommandMaterializer::new(
            command.clone(),
            config.cache_dir.clone(),
        )),
        None => Arc::new(LocalMaterializer),
    }
}

/// Accepts only binaries already on local disk.
pub struct LocalMaterializer;

async fn existing_local(reference: &BinaryReference) -> Option<PathBuf> {
    let path = reference.local.as_ref()?;
    match tokio::fs::try_exists(path).await {
        Ok(true) => Some(path.clone()),
        _ => None,
    }
}

#[async_trait]
impl Materializer for LocalMaterializer {
    async fn materialize(&self, reference: &BinaryReference) -> MaterializeResult<PathBuf> {
        if let Some(path) = existing_local(reference).await {
            return Ok(path);
        }
        match (&reference.local, &reference.remote) {
            (_, Some(remote)) => Err(MaterializeError::NoDownloadCommand(remote.clone())),
            (Some(local), None) => Err(MaterializeError::NotFound(local.clone())),
            (None, None) => Err(MaterializeError::EmptyReference),
        }
    }
}

/// Downloads remote binaries with a shell command template.
///
/// `{remote}` and `{local}` in the template are replaced by the shell-quoted
/// remote path and cache destination. Downloads land in
/// `<cache_dir>/<hash of remote>/<file name>` and are reused on later runs.
/// Concurrent requests for the same remote share one download. The command
/// writes to `<file name>.part`, which is renamed into place on success.
pub struct CommandMaterializer {
    command: String,
    cache_dir: PathBuf,
    in_flight: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl CommandMaterializer {
    pub fn new(command: String, cache_dir: PathBuf) -> Self {
        Self {
            command,
            cache_dir,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, target: &Path) -> Arc<Mutex<()>> {
        self.in_flight
            .lock()
            .await
            .entry(target.to_path_buf())
            .or_default()
            .clone()
    }

    fn cache_path(&self, remote: &str) -> PathBuf {
        let digest = Sha256::digest(remote.as_bytes());
        let key: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
        let file_name = remote
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("binary");
        self.cache_dir.join(key).join(file_name)
    }

    fn render(&self, remote: &str, local: &Path) -> MaterializeResult<String> {
        if !self.command.contains("{remote}") || !self.command.contains("{local}") {
            return Err(MaterializeError::InvalidCommand(format!(
                "'{}' must contain {{remote}} and {{local}}",
                self.command
            )));
        }
        let local = local.to_string_lossy();
        Ok(self
            .command
            .replace("{remote}", &shell_words::quote(remote))
            .replace("{local}", &shell_words::quote(&local)))
    }

    /// Runs the download into a `.part` sibling of `target` and renames it
    /// into place once the command succeeds. An interrupted download never
    /// leaves a file at `target`.
    async fn download(&self, remote: &str, target: &Path) -> MaterializeResult<()> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(target);
        remove_if_present(&partial).await?;
        let command = self.render(remote, &partial)?;
        info!("Downloading {remote}");
        debug!("Running: {command}");

        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            remove_if_present(&partial).await?;
            return Err(MaterializeError::DownloadFailed {
                remote: remote.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if !tokio::fs::try_exists(&partial).await? {
            return Err(MaterializeError::DownloadFailed {
                remote: remote.to_string(),
                status: output.status.to_string(),
                stderr: format!("command did not create {}", partial.display()),
            });
        }
        tokio::fs::rename(&partial, target).await?;
        Ok(())
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    target.with_file_name(name)
}

async fn remove_if_present(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl Materializer for CommandMaterializer {
    async fn materialize(&self, reference: &BinaryReference) -> MaterializeResult<PathBuf> {
        if let Some(path) = existing_local(reference).await {
            return Ok(path);
        }
        let Some(remote) = reference.remote.as_deref() else {
            return Err(match &reference.local {
                Some(local) => MaterializeError::NotFound(local.clone()),
                None => MaterializeError::EmptyReference,
            });
        };

        let target = self.cache_path(remote);
        let lock = self.lock_for(&target).await;
        let _guard = lock.lock().await;
        let result = if tokio::fs::try_exists(&target).await? {
            debug!("Using cached {} for {remote}", target.display());
            Ok(())
        } else {
            self.download(remote, &target).await
        };
        // Waiters already hold the lock; later callers find the cached file.
        self.in_flight.lock().await.remove(&target);
        result.map(|()| target)
    }
}
