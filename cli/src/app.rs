//! Application context: unified state passed to every command handler.
//!
//! `AppContext` owns the output context, the config store and the
//! cancellation token wired to Ctrl-C. Adapters that need configuration
//! (state database, provider, SSH) are built on demand from it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::application::ports::ConfigStore;
use crate::domain::config::KeelConfig;
use crate::infra::aws::AwsCliProvider;
use crate::infra::command_runner::{DEFAULT_CMD_TIMEOUT, DEFAULT_REMOTE_TIMEOUT, TokioCommandRunner};
use crate::infra::config::YamlConfigStore;
use crate::infra::http::ReqwestProber;
use crate::infra::ssh::{KnownHostsManager, SshExecutor};
use crate::infra::store::SqliteStore;
use crate::output::{HumanRenderer, OutputContext};

/// Output rendering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Human-readable terminal output (default).
    Human,
    /// Machine-readable JSON output.
    Json,
}

/// Output rendering flags.
pub struct OutputFlags {
    /// Disable ANSI color output.
    pub no_color: bool,
    /// Suppress non-error output.
    pub quiet: bool,
    /// Enable JSON output mode.
    pub json: bool,
}

/// Behaviour flags.
pub struct BehaviourFlags {
    /// Skip interactive prompts (also set by `CI` / `KEEL_YES` env vars).
    pub yes: bool,
}

/// Flags passed from the top-level CLI to `AppContext::new`.
pub struct AppFlags {
    /// Output rendering options.
    pub output: OutputFlags,
    /// Behaviour options.
    pub behaviour: BehaviourFlags,
}

/// `KEEL_*` environment, loaded via `envy`.
///
/// `KEEL_CONFIG` and `KEEL_STATE_DB` are resolved by their adapters.
#[derive(Debug, Default, Deserialize)]
pub struct KeelEnv {
    /// Acting identity for runs and decisions (`KEEL_ACTOR`).
    pub actor: Option<String>,
    /// Presence of `KEEL_YES` disables prompts.
    pub yes: Option<String>,
}

impl KeelEnv {
    /// # Errors
    ///
    /// Returns an error if a `KEEL_*` variable cannot be decoded.
    pub fn load() -> Result<Self> {
        envy::prefixed("KEEL_")
            .from_env()
            .context("cannot read KEEL_* environment")
    }
}

/// Unified application context passed to every command handler.
pub struct AppContext {
    /// Terminal output context (colors, quiet mode).
    pub output: OutputContext,
    /// Output rendering mode (human vs JSON).
    pub mode: OutputMode,
    /// `~/.keel/config.yaml`.
    pub config_store: YamlConfigStore,
    /// Acting identity, from `KEEL_ACTOR` or `USER`.
    pub actor: Option<String>,
    /// When `true`, skip interactive prompts and use defaults.
    pub non_interactive: bool,
    /// Cancelled on Ctrl-C.
    pub cancel: CancellationToken,
}

impl AppContext {
    /// Construct an `AppContext` from top-level CLI flags.
    ///
    /// # Errors
    ///
    /// Returns an error if the `KEEL_*` environment is malformed.
    pub fn new(flags: &AppFlags, cancel: CancellationToken) -> Result<Self> {
        let env = KeelEnv::load()?;
        let non_interactive =
            flags.behaviour.yes || env.yes.is_some() || std::env::var("CI").is_ok();

        let mode = if flags.output.json {
            OutputMode::Json
        } else {
            OutputMode::Human
        };

        Ok(Self {
            output: OutputContext::new(flags.output.no_color, flags.output.quiet || flags.output.json),
            mode,
            config_store: YamlConfigStore::new(),
            actor: env
                .actor
                .or_else(|| std::env::var("USER").ok())
                .filter(|a| !a.is_empty()),
            non_interactive,
            cancel,
        })
    }

    /// Returns `true` when JSON output mode is active.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.mode == OutputMode::Json
    }

    #[must_use]
    pub fn renderer(&self) -> HumanRenderer<'_> {
        HumanRenderer::new(&self.output)
    }

    /// Load `~/.keel/config.yaml` (defaults when absent).
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn config(&self) -> Result<KeelConfig> {
        self.config_store.load()
    }

    /// The acting identity.
    ///
    /// # Errors
    ///
    /// Returns an error when neither `KEEL_ACTOR` nor `USER` is set.
    pub fn actor(&self) -> Result<&str> {
        self.actor
            .as_deref()
            .context("cannot determine acting identity: set KEEL_ACTOR")
    }

    /// Open the state database named by `KEEL_STATE_DB` or the config.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created or migrated.
    pub fn open_store(&self, config: &KeelConfig) -> Result<SqliteStore> {
        SqliteStore::open(SqliteStore::resolve_path(config.state.database.as_deref())?)
    }

    /// Adapters for a run that talks to the provider and the instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the home directory is unknown or the HTTP client
    /// cannot be built.
    pub fn run_adapters(&self, config: &KeelConfig) -> Result<RunAdapters> {
        let provider = AwsCliProvider::new(
            TokioCommandRunner::new(DEFAULT_CMD_TIMEOUT),
            config.provider.region.clone(),
            config.provider.profile.clone(),
        );
        let remote = SshExecutor::new(
            TokioCommandRunner::new(DEFAULT_REMOTE_TIMEOUT),
            &config.ssh.user,
            config.ssh.private_key.as_deref().map(expand_home),
            KnownHostsManager::new()?,
        );
        Ok(RunAdapters {
            provider,
            remote,
            prober: ReqwestProber::new()?,
        })
    }

    /// Ask the user for confirmation.
    ///
    /// When `non_interactive` is `true` (CI, `--yes` flag, or `KEEL_YES` env),
    /// returns `default` immediately without prompting.
    ///
    /// # Errors
    ///
    /// Returns an error if the terminal prompt fails (e.g. no TTY available).
    pub fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        if self.non_interactive {
            return Ok(default);
        }
        let confirmed = dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(default)
            .interact()?;
        Ok(confirmed)
    }
}

/// Production adapters consumed by the orchestrator.
pub struct RunAdapters {
    pub provider: AwsCliProvider<TokioCommandRunner>,
    pub remote: SshExecutor<TokioCommandRunner>,
    pub prober: ReqwestProber,
}

/// Expand a leading `~/` to the home directory.
#[must_use]
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
