//! Instance bootstrap script, content digests and run identifiers.

use sha2::{Digest, Sha256};

/// File the bootstrap script creates once the container runtime is usable.
pub const BOOT_MARKER: &str = "/var/lib/keel/bootstrap-complete";

/// Cloud-init user data used when the manifest declares none.
pub const DEFAULT_BOOTSTRAP: &str = r#"#!/bin/bash
set -euo pipefail
export DEBIAN_FRONTEND=noninteractive
if ! command -v docker >/dev/null 2>&1; then
  apt-get update -y
  apt-get install -y docker.io
fi
systemctl enable --now docker
mkdir -p /var/lib/keel
touch /var/lib/keel/bootstrap-complete
"#;

/// Lowercase hex encoding.
#[must_use]
pub fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(char::from(HEX[(b >> 4) as usize]));
        out.push(char::from(HEX[(b & 0xf) as usize]));
    }
    out
}

/// SHA-256 of `content`, hex encoded.
#[must_use]
pub fn digest(content: &str) -> String {
    hex_encode(&Sha256::digest(content.as_bytes()))
}

/// The user data an instance is created with.
#[must_use]
pub fn effective_bootstrap(declared: Option<&str>) -> &str {
    declared.unwrap_or(DEFAULT_BOOTSTRAP)
}

/// Generate a unique run identifier.
///
/// Format: `run-` followed by 16 lowercase hex characters.
/// Entropy sources: nanosecond timestamp and two independent `RandomState` hashes.
#[must_use]
pub fn generate_run_id() -> String {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    );
    hasher.write_u64(RandomState::new().build_hasher().finish());
    hasher.write_u64(RandomState::new().build_hasher().finish());
    format!("run-{:016x}", hasher.finish())
}
