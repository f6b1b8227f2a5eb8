//! HTTP verification of a converged endpoint.

use anyhow::Result;
use keel_common::{Endpoint, Probe, ProbeResult, VerificationResult};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::HttpProber;
use crate::application::services::poll::sleep_or_cancel;
use crate::domain::verify::{ProbePolicy, classify, probe_url, summarize};

/// Send every probe to `endpoint` on `port` and collect the results.
///
/// A probe passes on its first matching attempt. The result passes only if
/// every probe passed.
///
/// # Errors
///
/// Only [`DeployError::Cancelled`](crate::domain::error::DeployError::Cancelled);
/// probe failures are reported in the result.
pub async fn verify(
    prober: &impl HttpProber,
    endpoint: &Endpoint,
    port: u16,
    probes: &[Probe],
    policy: &ProbePolicy,
    cancel: &CancellationToken,
) -> Result<VerificationResult> {
    let mut results = Vec::with_capacity(probes.len());
    for probe in probes {
        let result = run_probe(prober, endpoint, port, probe, policy, cancel).await?;
        tracing::info!(
            method = probe.method.as_str(),
            path = %probe.path,
            passed = result.passed,
            attempts = result.attempts,
            latency_ms = result.latency_ms,
            "probe finished"
        );
        results.push(result);
    }
    Ok(summarize(results))
}

async fn run_probe(
    prober: &impl HttpProber,
    endpoint: &Endpoint,
    port: u16,
    probe: &Probe,
    policy: &ProbePolicy,
    cancel: &CancellationToken,
) -> Result<ProbeResult> {
    let url = probe_url(&endpoint.address, port, &probe.path);
    let mut last_status = None;
    let mut last_error = None;
    let mut latency_ms = 0;

    for attempt in 1..=policy.attempts {
        let started = Instant::now();
        let response = prober.send(probe.method, &url, policy.timeout).await;
        latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let outcome = match response {
            Ok(resp) => {
                last_status = Some(resp.status);
                classify(probe, &resp)
            }
            Err(e) => {
                last_status = None;
                Err(format!("{e:#}"))
            }
        };
        match outcome {
            Ok(()) => {
                return Ok(ProbeResult {
                    probe: probe.clone(),
                    passed: true,
                    status: last_status,
                    latency_ms,
                    attempts: attempt,
                    error: None,
                });
            }
            Err(reason) => {
                tracing::debug!(url = %url, attempt, reason = %reason, "probe attempt failed");
                last_error = Some(reason);
            }
        }
        if attempt < policy.attempts {
            sleep_or_cancel(policy.retry_delay, cancel).await?;
        }
    }

    Ok(ProbeResult {
        probe: probe.clone(),
        passed: false,
        status: last_status,
        latency_ms,
        attempts: policy.attempts,
        error: last_error,
    })
}
