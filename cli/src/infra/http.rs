//! `HttpProber` over reqwest.

use std::time::Duration;

use anyhow::{Context, Result};
use keel_common::HttpMethod;

use crate::application::ports::HttpProber;
use crate::domain::verify::ProbeResponse;

/// Probe bodies are only searched for a short marker.
const MAX_BODY_BYTES: usize = 64 * 1024;

pub struct ReqwestProber {
    client: reqwest::Client,
}

impl ReqwestProber {
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialised.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("keel/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("cannot build HTTP client")?;
        Ok(Self { client })
    }
}

impl HttpProber for ReqwestProber {
    async fn send(&self, method: HttpMethod, url: &str, timeout: Duration) -> Result<ProbeResponse> {
        let method = match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Post => reqwest::Method::POST,
        };
        let mut response = self
            .client
            .request(method, url)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("request to {url} failed"))?;
        let status = response.status().as_u16();

        // Stop reading once the cap is reached; the rest is never buffered.
        let mut bytes = Vec::new();
        while bytes.len() < MAX_BODY_BYTES {
            let Some(chunk) = response
                .chunk()
                .await
                .with_context(|| format!("reading body from {url}"))?
            else {
                break;
            };
            let room = MAX_BODY_BYTES - bytes.len();
            bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }
        let body = String::from_utf8_lossy(&bytes).into_owned();
        Ok(ProbeResponse { status, body })
    }
}
