//! Container workload: remote docker commands and the keep/replace decision.
//!
//! Commands are rendered as single shell strings for the remote channel.
//! Every user-supplied value goes through [`shell_quote`].

use keel_common::{RegistryCredentials, WorkloadDescriptor};
use serde::{Deserialize, Serialize};

use crate::domain::bootstrap::digest;

/// Container label carrying the digest of the descriptor it was started from.
pub const SPEC_LABEL: &str = "keel.spec";

/// Install the container runtime only when absent, then make sure it runs.
pub const ENSURE_RUNTIME: &str = "command -v docker >/dev/null 2>&1 || \
(sudo apt-get update -y && sudo DEBIAN_FRONTEND=noninteractive apt-get install -y docker.io); \
sudo systemctl enable --now docker";

const INSPECT_FORMAT: &str = r#"{{.Image}}|{{.State.Status}}|{{index .Config.Labels "keel.spec"}}"#;

/// Quote `s` for a POSIX shell.
#[must_use]
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '=' | ','))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Digest of everything that shapes the running container.
///
/// Registry credentials are excluded: they affect the pull, not the container.
#[must_use]
pub fn spec_digest(w: &WorkloadDescriptor) -> String {
    let shape = WorkloadDescriptor {
        registry_credentials: None,
        ..w.clone()
    };
    digest(&serde_json::to_string(&shape).unwrap_or_default())
}

#[must_use]
pub fn login_command(creds: &RegistryCredentials) -> String {
    format!(
        "sudo docker login {} --username {} --password-stdin",
        shell_quote(&creds.registry),
        shell_quote(&creds.username)
    )
}

#[must_use]
pub fn pull_command(image: &str) -> String {
    format!("sudo docker pull {}", shell_quote(image))
}

#[must_use]
pub fn image_id_command(image: &str) -> String {
    format!(
        "sudo docker image inspect --format {} {}",
        shell_quote("{{.Id}}"),
        shell_quote(image)
    )
}

#[must_use]
pub fn inspect_command(container: &str) -> String {
    format!(
        "sudo docker inspect --format {} {}",
        shell_quote(INSPECT_FORMAT),
        shell_quote(container)
    )
}

#[must_use]
pub fn status_command(container: &str) -> String {
    format!(
        "sudo docker inspect --format {} {}",
        shell_quote("{{.State.Status}}"),
        shell_quote(container)
    )
}

#[must_use]
pub fn remove_command(container: &str) -> String {
    format!("sudo docker rm -f {}", shell_quote(container))
}

#[must_use]
pub fn run_command(w: &WorkloadDescriptor, spec: &str) -> String {
    let mut parts = vec![
        "sudo docker run -d".to_string(),
        format!("--name {}", shell_quote(&w.container_name)),
        format!("--restart {}", w.restart_policy.as_str()),
        format!("-p {}:{}", w.published_port, w.target_port()),
    ];
    for (key, value) in &w.env {
        parts.push(format!("-e {}", shell_quote(&format!("{key}={value}"))));
    }
    parts.push(format!("--label {}", shell_quote(&format!("{SPEC_LABEL}={spec}"))));
    parts.push(shell_quote(&w.image_reference));
    parts.join(" ")
}

/// What `docker inspect` reported about the named container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub image_id: String,
    pub status: String,
    pub spec_label: Option<String>,
}

/// Parse the output of [`inspect_command`].
#[must_use]
pub fn parse_inspect(stdout: &str) -> Option<ContainerState> {
    let line = stdout.lines().next()?.trim();
    let mut fields = line.splitn(3, '|');
    let image_id = fields.next()?.trim();
    let status = fields.next()?.trim();
    let label = fields.next().map(str::trim).unwrap_or_default();
    if image_id.is_empty() {
        return None;
    }
    Some(ContainerState {
        image_id: image_id.to_string(),
        status: status.to_string(),
        spec_label: (!label.is_empty() && label != "<no value>").then(|| label.to_string()),
    })
}

/// What convergence did to the container.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    /// Already running the desired image and spec.
    Kept,
    /// No container existed; one was started.
    Started,
    /// A drifted container was removed and started again.
    Replaced,
}

impl ContainerAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Kept => "kept",
            Self::Started => "started",
            Self::Replaced => "replaced",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConvergeOutcome {
    pub action: ContainerAction,
    pub image_id: String,
}

/// Decide how to bring `current` to the desired image and spec.
#[must_use]
pub fn decide(current: Option<&ContainerState>, image_id: &str, spec: &str) -> ContainerAction {
    match current {
        None => ContainerAction::Started,
        Some(c)
            if c.status == "running"
                && c.image_id == image_id
                && c.spec_label.as_deref() == Some(spec) =>
        {
            ContainerAction::Kept
        }
        Some(_) => ContainerAction::Replaced,
    }
}
