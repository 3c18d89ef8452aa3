//! Control of the local NGINX process and its configuration tree.
//!
//! The driver is the only writer under the configuration directory. Every
//! reload first validates the on-disk configuration; a rejected
//! configuration never reaches the process, which keeps serving its
//! previous state.

pub mod config;
pub mod stream;

use log::{debug, info};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::Command;

use self::config::MainConfig;
use self::stream::StreamConfig;

/// Whether the driver actually controls an NGINX process. In dry-run mode
/// configuration files are still written (so the output can be inspected)
/// but no process is started, validated or signalled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    Full,
    DryRun,
}

#[derive(thiserror::Error, Debug)]
pub enum NginxError {
    /// Validation rejected the on-disk configuration; the previous
    /// configuration stays active.
    #[error("configuration rejected by validation: {0}")]
    ConfigInvalid(String),
    /// Validation passed but the reload signal failed; the previous
    /// configuration stays active.
    #[error("reload failed: {0}")]
    ReloadFailed(String),
    #[error("nginx start failed: {0}")]
    StartFailed(String),
    #[error("configuration i/o: {0}")]
    Io(#[from] io::Error),
}

pub struct NginxDriver {
    conf_dir: PathBuf,
    mode: Mode,
    main: MainConfig,
    reloads: AtomicU64,
}

impl NginxDriver {
    pub fn new(conf_dir: PathBuf, mode: Mode, main: MainConfig) -> Self {
        Self {
            conf_dir,
            mode,
            main,
            reloads: AtomicU64::new(0),
        }
    }

    fn conf_d(&self) -> PathBuf {
        self.conf_dir.join("conf.d")
    }

    fn main_file(&self) -> PathBuf {
        self.conf_dir.join("nginx.conf")
    }

    fn stream_file(&self, name: &str) -> PathBuf {
        self.conf_d().join(format!("{name}.stream.conf"))
    }

    /// Number of reloads requested so far (dry-run included).
    pub fn reloads(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    pub async fn ensure_dirs(&self) -> Result<(), NginxError> {
        tokio::fs::create_dir_all(self.conf_d()).await?;
        Ok(())
    }

    pub async fn start(&self) -> Result<(), NginxError> {
        if self.mode == Mode::DryRun {
            info!("dry-run: not starting nginx");
            return Ok(());
        }
        self.exec_nginx(&[]).await.map_err(NginxError::StartFailed)
    }

    /// Validates the on-disk configuration and, only if it passes, signals
    /// the process to reload. The configurator lock serializes callers, so
    /// at most one reload is ever in flight.
    pub async fn reload(&self) -> Result<(), NginxError> {
        if self.mode == Mode::DryRun {
            debug!("dry-run: skipping validation and reload");
            self.reloads.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        self.exec_nginx(&["-t"])
            .await
            .map_err(NginxError::ConfigInvalid)?;
        self.exec_nginx(&["-s", "reload"])
            .await
            .map_err(NginxError::ReloadFailed)?;

        self.reloads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes the main configuration file. Returns whether the file
    /// changed.
    pub async fn write_main(&self) -> Result<bool, NginxError> {
        let rendered = self.main.render(&self.conf_d());
        self.write_if_changed(&self.main_file(), rendered.as_bytes())
            .await
    }

    /// Re-renders the main configuration and reloads if it changed.
    pub async fn update_main(&self) -> Result<(), NginxError> {
        if self.write_main().await? {
            self.reload().await?;
        }
        Ok(())
    }

    /// Writes a per-service stream configuration. Returns whether the file
    /// changed, so an unchanged render costs no reload.
    pub async fn write_stream(&self, name: &str, config: &StreamConfig) -> Result<bool, NginxError> {
        let rendered = config.to_string();
        self.write_if_changed(&self.stream_file(name), rendered.as_bytes())
            .await
    }

    /// Removes a per-service configuration. A missing file is not an
    /// error: most deleted services were never rendered.
    pub async fn delete_stream(&self, name: &str) -> Result<bool, NginxError> {
        let path = self.stream_file(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("deleted {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_if_changed(&self, path: &Path, content: &[u8]) -> Result<bool, NginxError> {
        if let Ok(existing) = tokio::fs::read(path).await {
            if existing == content {
                debug!("{}: unchanged", path.display());
                return Ok(false);
            }
        }

        // write-then-rename so the proxy never sees a partial file
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;

        info!("wrote {}", path.display());
        Ok(true)
    }

    async fn exec_nginx(&self, args: &[&str]) -> Result<(), String> {
        debug!("executing nginx {args:?}");
        let output = Command::new("nginx")
            .arg("-c")
            .arg(self.main_file())
            .args(args)
            .output()
            .await
            .map_err(|e| format!("exec: {e}"))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(format!(
                "exit {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
        }
    }
}
