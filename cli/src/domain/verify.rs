//! Probe classification for deployment verification.

use std::time::Duration;

use keel_common::{Probe, ProbeResult, VerificationResult};

/// Per-probe request budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub timeout: Duration,
    pub attempts: u32,
    pub retry_delay: Duration,
}

/// Raw HTTP response as seen by a prober.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResponse {
    pub status: u16,
    pub body: String,
}

#[must_use]
pub fn probe_url(address: &str, port: u16, path: &str) -> String {
    if port == 80 {
        format!("http://{address}{path}")
    } else {
        format!("http://{address}:{port}{path}")
    }
}

/// Check a response against a probe's expectations.
///
/// # Errors
///
/// Returns a human-readable reason when the response does not match.
pub fn classify(probe: &Probe, response: &ProbeResponse) -> Result<(), String> {
    if response.status != probe.expect_status {
        return Err(format!(
            "expected status {}, got {}",
            probe.expect_status, response.status
        ));
    }
    if let Some(needle) = &probe.body_contains {
        if !response.body.contains(needle.as_str()) {
            return Err(format!("response body does not contain {needle:?}"));
        }
    }
    Ok(())
}

/// A run passes only if every probe passed.
#[must_use]
pub fn summarize(probes: Vec<ProbeResult>) -> VerificationResult {
    VerificationResult {
        passed: !probes.is_empty() && probes.iter().all(|p| p.passed),
        probes,
    }
}
