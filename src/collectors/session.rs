use super::transport::{TransportKey, TransportLease, TransportPool};
use crate::profile::{ConnectionProfile, ProfileError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tokio::time;
use tracing::debug;

const ASKPASS_FILE: &str = "fleetmon-askpass.sh";
/// Exit status OpenSSH reserves for its own connection errors.
const SSH_CONNECTION_ERROR: i32 = 255;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    InvalidProfile(#[from] ProfileError),
    #[error("failed to prepare control directory {path}: {source}")]
    Prepare {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to prepare askpass helper: {0}")]
    Helper(std::io::Error),
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },
    #[error("failed to collect ssh output: {0}")]
    Io(std::io::Error),
    #[error("timed out after {0}s")]
    Timeout(u64),
    #[error("{message}")]
    RemoteFailed {
        status: Option<i32>,
        message: String,
    },
    #[error("remote output is not valid UTF-8")]
    InvalidUtf8,
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(
        &self,
        profile: &ConnectionProfile,
        script: &str,
    ) -> Result<String, SessionError>;

    /// Closes transports that have not been used within the idle window.
    async fn evict_idle(&self) {}

    async fn release(&self, _profile: &ConnectionProfile) {}
}

#[derive(Debug, Clone)]
pub struct SshSettings {
    pub binary: String,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub control_persist: Duration,
    pub control_dir: PathBuf,
    pub askpass_env: String,
    pub accept_unknown_hosts: bool,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            binary: "ssh".to_string(),
            connect_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(15),
            control_persist: Duration::from_secs(600),
            control_dir: default_control_dir(),
            askpass_env: "FLEETMON_SSH_PASSWORD".to_string(),
            accept_unknown_hosts: true,
        }
    }
}

pub fn default_control_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("sockets"))
        .unwrap_or_else(|| std::env::temp_dir().join("fleetmon-sockets"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential<'a> {
    IdentityFile(&'a str),
    Password(&'a str),
    /// Keys from the agent or the default identities, never prompting.
    NonInteractive,
}

pub fn credential_for(profile: &ConnectionProfile) -> Credential<'_> {
    if let Some(path) = profile.identity_file.as_deref().filter(|p| !p.is_empty()) {
        return Credential::IdentityFile(path);
    }
    match profile.password.as_deref() {
        Some(secret) if !secret.is_empty() => Credential::Password(secret),
        _ => Credential::NonInteractive,
    }
}

pub fn build_ssh_args(
    settings: &SshSettings,
    profile: &ConnectionProfile,
    control_path: &Path,
    script: &str,
) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        "ControlMaster=auto".to_string(),
        "-o".to_string(),
        format!("ControlPath={}", control_path.display()),
        "-o".to_string(),
        format!("ControlPersist={}", settings.control_persist.as_secs()),
        "-o".to_string(),
        format!("ConnectTimeout={}", settings.connect_timeout.as_secs().max(1)),
        "-o".to_string(),
        format!(
            "StrictHostKeyChecking={}",
            if settings.accept_unknown_hosts { "no" } else { "yes" }
        ),
    ];

    match credential_for(profile) {
        Credential::IdentityFile(path) => {
            args.extend(["-i".to_string(), path.to_string()]);
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
        Credential::Password(_) => {
            args.extend(["-o".to_string(), "BatchMode=no".to_string()]);
            args.extend(["-o".to_string(), "NumberOfPasswordPrompts=1".to_string()]);
        }
        Credential::NonInteractive => {
            args.extend(["-o".to_string(), "BatchMode=yes".to_string()]);
        }
    }

    if let Some(jump) = profile.proxy_jump.as_deref().filter(|v| !v.is_empty()) {
        args.extend(["-J".to_string(), jump.to_string()]);
    }
    if let Some(command) = profile.proxy_command.as_deref().filter(|v| !v.is_empty()) {
        args.extend(["-o".to_string(), format!("ProxyCommand={command}")]);
    }

    args.extend([
        "-p".to_string(),
        profile.port.to_string(),
        format!("{}@{}", profile.username, profile.host),
        script.to_string(),
    ]);
    args
}

pub struct SshExecutor {
    settings: SshSettings,
    pool: TransportPool,
    control_dir: OnceCell<()>,
    askpass: OnceCell<PathBuf>,
}

impl SshExecutor {
    pub fn new(settings: SshSettings) -> Self {
        let pool = TransportPool::new(settings.control_dir.clone(), settings.control_persist);
        Self {
            settings,
            pool,
            control_dir: OnceCell::new(),
            askpass: OnceCell::new(),
        }
    }

    async fn prepare_control_dir(&self) -> Result<(), SessionError> {
        self.control_dir
            .get_or_try_init(|| async {
                let dir = self.pool.control_dir();
                let prepared = async {
                    tokio::fs::create_dir_all(dir).await?;
                    restrict_permissions(dir).await
                };
                prepared.await.map_err(|source| SessionError::Prepare {
                    path: dir.display().to_string(),
                    source,
                })
            })
            .await
            .map(|_| ())
    }

    async fn askpass_helper(&self) -> Result<&Path, SessionError> {
        self.askpass
            .get_or_try_init(|| async {
                let path = self.pool.control_dir().join(ASKPASS_FILE);
                let body = format!("#!/bin/sh\nprintf '%s\\n' \"${}\"\n", self.settings.askpass_env);
                tokio::fs::write(&path, body)
                    .await
                    .map_err(SessionError::Helper)?;
                restrict_permissions(&path)
                    .await
                    .map_err(SessionError::Helper)?;
                Ok(path)
            })
            .await
            .map(PathBuf::as_path)
    }

    /// Drops the pool entry and asks the control master to exit, so the next
    /// checkout of the same socket path starts a new master.
    async fn discard_transport(&self, key: &TransportKey) {
        match self.pool.release(key).await {
            Some(lease) => self.close_master(&lease).await,
            None => debug!(transport = %key, "no transport to release"),
        }
    }

    async fn close_master(&self, lease: &TransportLease) {
        let result = time::timeout(
            self.settings.connect_timeout,
            Command::new(&self.settings.binary)
                .args(["-O", "exit", "-o"])
                .arg(format!("ControlPath={}", lease.control_path.display()))
                .arg("-p")
                .arg(lease.key.port.to_string())
                .arg(format!("{}@{}", lease.key.user, lease.key.host))
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await;

        match result {
            Ok(Ok(status)) => debug!(transport = %lease.key, %status, "closed control master"),
            Ok(Err(err)) => debug!(transport = %lease.key, error = %err, "control master close failed"),
            Err(_elapsed) => debug!(transport = %lease.key, "control master close timed out"),
        }
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn execute(
        &self,
        profile: &ConnectionProfile,
        script: &str,
    ) -> Result<String, SessionError> {
        profile.validate()?;
        self.prepare_control_dir().await?;

        let key = TransportKey::new(&profile.username, &profile.host, profile.port);
        let lease = self.pool.checkout(&key, Instant::now()).await;
        debug!(transport = %key, reused = lease.reused, "running inspection script");

        let mut command = Command::new(&self.settings.binary);
        command
            .args(build_ssh_args(
                &self.settings,
                profile,
                &lease.control_path,
                script,
            ))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Credential::Password(secret) = credential_for(profile) {
            let helper = self.askpass_helper().await?;
            command
                .env("SSH_ASKPASS", helper)
                .env("SSH_ASKPASS_REQUIRE", "force")
                .env(&self.settings.askpass_env, secret);
            if std::env::var_os("DISPLAY").is_none() {
                command.env("DISPLAY", ":0");
            }
        }

        let child = command.spawn().map_err(|source| SessionError::Spawn {
            binary: self.settings.binary.clone(),
            source,
        })?;

        let output = match time::timeout(self.settings.command_timeout, child.wait_with_output())
            .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(SessionError::Io(err)),
            Err(_elapsed) => {
                self.discard_transport(&key).await;
                return Err(SessionError::Timeout(self.settings.command_timeout.as_secs()));
            }
        };

        if !output.status.success() {
            let status = output.status.code();
            if status == Some(SSH_CONNECTION_ERROR) {
                self.discard_transport(&key).await;
            }
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() {
                match status {
                    Some(code) => format!("exit status {code}"),
                    None => "terminated by signal".to_string(),
                }
            } else {
                stderr
            };
            return Err(SessionError::RemoteFailed { status, message });
        }

        String::from_utf8(output.stdout).map_err(|_| SessionError::InvalidUtf8)
    }

    async fn evict_idle(&self) {
        let evicted = self.pool.evict_idle(Instant::now()).await;
        if evicted.is_empty() {
            return;
        }
        for lease in &evicted {
            self.close_master(lease).await;
        }
        let remaining = self.pool.len().await;
        debug!(evicted = evicted.len(), remaining, "idle transports closed");
    }

    async fn release(&self, profile: &ConnectionProfile) {
        let key = TransportKey::new(&profile.username, &profile.host, profile.port);
        self.discard_transport(&key).await;
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    tracing::warn!(path = %path.display(), "cannot restrict permissions on this platform");
    Ok(())
}
