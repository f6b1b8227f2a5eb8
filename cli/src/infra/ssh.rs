//! SSH remote execution with a keel-owned `known_hosts` file.

use std::path::{Path, PathBuf};
use std::process::Output;

use anyhow::{Context, Result};

use crate::application::ports::{CommandRunner, RemoteExecutor};
use crate::domain::error::DeployError;

/// ssh exits 255 when the connection itself failed.
const SSH_CONNECT_FAILURE: i32 = 255;

/// Manages `~/.keel/known_hosts`, the pin file for workload host keys.
///
/// New hosts are accepted on first contact (`accept-new`); a changed key
/// is refused unless the entry was forgotten first.
pub struct KnownHostsManager {
    path: PathBuf,
}

impl KnownHostsManager {
    /// Creates a manager pointing at `~/.keel/known_hosts`.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory cannot be determined.
    pub fn new() -> Result<Self> {
        let home =
            dirs::home_dir().ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
        Ok(Self::with_path(home.join(".keel").join("known_hosts")))
    }

    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create the file (mode 600, parent 700) if it does not exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the file or directory cannot be created.
    pub fn ensure(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create dir {}", parent.display()))?;
            set_permissions(parent, 0o700)?;
        }
        if !self.path.exists() {
            std::fs::write(&self.path, "")
                .with_context(|| format!("write {}", self.path.display()))?;
        }
        set_permissions(&self.path, 0o600)
    }

    /// Drop every entry for `host`. Returns `true` if anything was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be rewritten.
    pub fn forget(&self, host: &str) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("read {}", self.path.display()))?;
        let kept: Vec<&str> = content
            .lines()
            .filter(|line| !entry_matches(line, host))
            .collect();
        if kept.len() == content.lines().count() {
            return Ok(false);
        }
        let mut rewritten = kept.join("\n");
        if !rewritten.is_empty() {
            rewritten.push('\n');
        }
        std::fs::write(&self.path, rewritten)
            .with_context(|| format!("write {}", self.path.display()))?;
        set_permissions(&self.path, 0o600)?;
        Ok(true)
    }
}

fn entry_matches(line: &str, host: &str) -> bool {
    let Some(hosts) = line.split_whitespace().next() else {
        return false;
    };
    hosts.split(',').any(|h| {
        h == host
            || h
                .strip_prefix('[')
                .and_then(|rest| rest.split_once(']'))
                .is_some_and(|(name, _)| name == host)
    })
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .with_context(|| format!("set permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

// ── Executor ──────────────────────────────────────────────────────────────────

/// `RemoteExecutor` over the system `ssh` client, key-based and
/// non-interactive.
pub struct SshExecutor<R: CommandRunner> {
    runner: R,
    user: String,
    identity: Option<PathBuf>,
    known_hosts: KnownHostsManager,
}

impl<R: CommandRunner> SshExecutor<R> {
    #[must_use]
    pub fn new(
        runner: R,
        user: &str,
        identity: Option<PathBuf>,
        known_hosts: KnownHostsManager,
    ) -> Self {
        Self {
            runner,
            user: user.to_string(),
            identity,
            known_hosts,
        }
    }

    fn args(&self, host: &str, command: &str) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", self.known_hosts.path().display()),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "ConnectTimeout=10".to_string(),
        ];
        if let Some(identity) = &self.identity {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }
        args.push("--".to_string());
        args.push(format!("{}@{host}", self.user));
        args.push(command.to_string());
        args
    }

    fn classify(host: &str, output: Output) -> Result<Output> {
        if output.status.code() == Some(SSH_CONNECT_FAILURE) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeployError::Connect {
                host: host.to_string(),
                reason: stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }
}

impl<R: CommandRunner> RemoteExecutor for SshExecutor<R> {
    async fn exec(&self, host: &str, command: &str) -> Result<Output> {
        self.known_hosts.ensure()?;
        let args = self.args(host, command);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.runner.run("ssh", &args).await?;
        Self::classify(host, output)
    }

    async fn exec_with_stdin(&self, host: &str, command: &str, input: &[u8]) -> Result<Output> {
        self.known_hosts.ensure()?;
        let args = self.args(host, command);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.runner.run_with_stdin("ssh", &args, input).await?;
        Self::classify(host, output)
    }

    async fn forget_host(&self, host: &str) -> Result<()> {
        if self.known_hosts.forget(host)? {
            tracing::info!(host, "forgot pinned host key");
        }
        Ok(())
    }
}
