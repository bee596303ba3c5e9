//! Optional pre-upload bandwidth probe.
//!
//! Uploads a fixed payload to a measurement endpoint through the engine's
//! own transport and derives an upstream bytes-per-second figure used for
//! time-to-completion estimates. The probe is strictly best-effort: any
//! failure returns `None` and the engine falls back to elapsed-wall
//! estimation.

use std::sync::Arc;
use std::time::Instant;

use reqwest::Method;
use tracing::debug;
use url::Url;

use crate::http::{HttpRequest, HttpTransport};

/// Default measurement endpoint (Cloudflare's public upload probe).
pub const DEFAULT_PROBE_URL: &str = "https://speed.cloudflare.com/__up";

/// Payload size for the probe.
pub const PROBE_PAYLOAD_LEN: usize = 256 * 1024;

/// One-shot upstream bandwidth probe.
pub struct SpeedProbe {
    transport: Arc<dyn HttpTransport>,
    url: Url,
    payload_len: usize,
}

impl SpeedProbe {
    /// Creates a probe against the default endpoint.
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            url: Url::parse(DEFAULT_PROBE_URL).expect("default probe URL is valid"),
            payload_len: PROBE_PAYLOAD_LEN,
        }
    }

    /// Overrides the measurement endpoint.
    pub fn with_url(mut self, url: Url) -> Self {
        self.url = url;
        self
    }

    /// Overrides the payload size.
    pub fn with_payload_len(mut self, len: usize) -> Self {
        self.payload_len = len;
        self
    }

    /// Measures upstream bandwidth in bytes per second.
    ///
    /// Returns `None` on any transport failure or non-success status.
    pub async fn measure(&self) -> Option<f64> {
        let mut request = HttpRequest::new(Method::POST, self.url.clone());
        request.body = Some(vec![0u8; self.payload_len]);

        let started = Instant::now();
        match self.transport.send(request).await {
            Ok(response) if response.status.is_success() => {
                let secs = started.elapsed().as_secs_f64();
                if secs <= 0.0 {
                    return None;
                }
                let rate = self.payload_len as f64 / secs;
                debug!(bytes_per_sec = rate, "bandwidth probe complete");
                Some(rate)
            }
            Ok(response) => {
                debug!(status = %response.status, "bandwidth probe rejected");
                None
            }
            Err(e) => {
                debug!(error = %e, "bandwidth probe failed");
                None
            }
        }
    }
}
