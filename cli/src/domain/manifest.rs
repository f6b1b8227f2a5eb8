//! Deployment manifest: the per-run declarative input.
//!
//! ```yaml
//! target: production
//! topology:
//!   instance_class: t3.micro
//!   image_id: ami-0abcdef1234567890
//!   ingress:
//!     - { protocol: tcp, port: 22, source: 0.0.0.0/0 }
//!     - { protocol: tcp, port: 80, source: 0.0.0.0/0 }
//!   ssh_credential: { name: deploy, public_key_path: ~/.ssh/id_ed25519.pub }
//! workload:
//!   image: registry.example.com/hello:1.4.2
//!   container_name: hello
//!   published_port: 80
//!   container_port: 5000
//!   env: { PORT: "5000" }
//! ```

use keel_common::{
    DeclaredTopology, HttpMethod, Probe, WorkloadDescriptor, validate_target_key,
};
use serde::{Deserialize, Serialize};

use crate::domain::error::ManifestError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentManifest {
    pub target: String,
    pub topology: DeclaredTopology,
    pub workload: WorkloadDescriptor,
    /// Verification probes. Empty selects [`default_probes`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub probes: Vec<Probe>,
}

impl DeploymentManifest {
    #[must_use]
    pub fn effective_probes(&self) -> Vec<Probe> {
        if self.probes.is_empty() {
            default_probes()
        } else {
            self.probes.clone()
        }
    }
}

/// Probes matching the reference workload: a greeting at `/` and a JSON
/// hostname document at `/hostname`.
#[must_use]
pub fn default_probes() -> Vec<Probe> {
    vec![
        Probe {
            method: HttpMethod::Get,
            path: "/".to_string(),
            expect_status: 200,
            body_contains: Some("Hello World".to_string()),
        },
        Probe {
            method: HttpMethod::Get,
            path: "/hostname".to_string(),
            expect_status: 200,
            body_contains: Some("hostname".to_string()),
        },
    ]
}

/// Parse and validate a manifest document.
///
/// # Errors
///
/// Returns [`ManifestError`] on malformed YAML or any invalid field.
pub fn parse_manifest(content: &str) -> Result<DeploymentManifest, ManifestError> {
    let manifest: DeploymentManifest = serde_yaml::from_str(content)?;
    validate_manifest(&manifest)?;
    Ok(manifest)
}

fn invalid(field: &str, reason: impl Into<String>) -> ManifestError {
    ManifestError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Validate every field that ends up in provider calls or remote commands.
///
/// # Errors
///
/// Returns the first invalid field.
pub fn validate_manifest(m: &DeploymentManifest) -> Result<(), ManifestError> {
    validate_target_key(&m.target)?;

    let topo = &m.topology;
    if !is_plain_token(&topo.instance_class) {
        return Err(invalid("topology.instance_class", "must be a non-empty token"));
    }
    if !is_plain_token(&topo.image_id) {
        return Err(invalid("topology.image_id", "must be a non-empty token"));
    }
    for (i, rule) in topo.ingress.iter().enumerate() {
        if rule.port == 0 {
            return Err(invalid(&format!("topology.ingress[{i}].port"), "must be 1-65535"));
        }
        if !is_ipv4_cidr(&rule.source) {
            return Err(invalid(
                &format!("topology.ingress[{i}].source"),
                format!("'{}' is not an IPv4 CIDR range", rule.source),
            ));
        }
    }
    if let Some(cred) = &topo.ssh_credential {
        if !is_plain_token(&cred.name) {
            return Err(invalid("topology.ssh_credential.name", "must be a non-empty token"));
        }
        if cred.public_key_path.trim().is_empty() {
            return Err(invalid("topology.ssh_credential.public_key_path", "must not be empty"));
        }
    }

    let w = &m.workload;
    if !is_plain_token(&w.image_reference) {
        return Err(invalid("workload.image", "must be a non-empty image reference"));
    }
    if !is_container_name(&w.container_name) {
        return Err(invalid(
            "workload.container_name",
            "must match [a-zA-Z0-9][a-zA-Z0-9_.-]*",
        ));
    }
    if w.published_port == 0 || w.container_port == Some(0) {
        return Err(invalid("workload.published_port", "ports must be 1-65535"));
    }
    for key in w.env.keys() {
        let ok = key
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !ok {
            return Err(invalid("workload.env", format!("'{key}' is not a valid variable name")));
        }
    }
    if let Some(creds) = &w.registry_credentials {
        if !is_plain_token(&creds.registry) || !is_plain_token(&creds.username) {
            return Err(invalid("workload.registry_credentials", "registry and username are required"));
        }
        if creds.password_env.is_empty() {
            return Err(invalid("workload.registry_credentials.password_env", "must name an environment variable"));
        }
    }

    for (i, probe) in m.probes.iter().enumerate() {
        if !probe.path.starts_with('/') || probe.path.contains(char::is_whitespace) {
            return Err(invalid(
                &format!("probes[{i}].path"),
                "must start with '/' and contain no whitespace",
            ));
        }
        if !(100..=599).contains(&probe.expect_status) {
            return Err(invalid(&format!("probes[{i}].expect_status"), "must be 100-599"));
        }
    }
    Ok(())
}

fn is_plain_token(s: &str) -> bool {
    !s.is_empty() && !s.contains(char::is_whitespace)
}

fn is_container_name(s: &str) -> bool {
    s.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn is_ipv4_cidr(s: &str) -> bool {
    let Some((addr, prefix)) = s.split_once('/') else {
        return false;
    };
    let prefix_ok = prefix.parse::<u8>().is_ok_and(|p| p <= 32);
    let octets: Vec<&str> = addr.split('.').collect();
    prefix_ok && octets.len() == 4 && octets.iter().all(|o| o.parse::<u8>().is_ok())
}
