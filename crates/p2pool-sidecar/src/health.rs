//! Health probing and the background monitor loop.
//!
//! The monitor is one tokio task per `start`. It sleeps an interval, then asks
//! the supervisor to run one tick (liveness check, then HTTP probe). A tick that
//! panics is logged and the loop carries on; the loop only exits when cancelled,
//! when the supervisor is gone, or when a tick reports the supervisor gave up.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Weak;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_STATUS_URL;
use crate::supervisor::ProcessSupervisor;
use crate::version::user_agent;

/// Default bound on a single health probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("health probe request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("health probe returned HTTP {0}")]
    HttpStatus(u16),
}

/// Network-level check that the pool answers, as opposed to merely existing.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<(), ProbeError>;
}

/// `GET` against the pool's status endpoint; only HTTP 200 counts as healthy.
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpHealthProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }

    /// Probe for a pool on its well-known local port.
    pub fn local() -> Self {
        Self::new(DEFAULT_STATUS_URL, DEFAULT_PROBE_TIMEOUT)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> Result<(), ProbeError> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::USER_AGENT, user_agent())
            .timeout(self.timeout)
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(()),
            status => Err(ProbeError::HttpStatus(status)),
        }
    }
}

/// What the monitor loop should do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickFlow {
    Continue,
    Exit,
}

pub(crate) async fn run_monitor(
    supervisor: Weak<ProcessSupervisor>,
    cancel: CancellationToken,
    interval: Duration,
) {
    tracing::info!(interval_ms = interval.as_millis(), "Health monitor started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(supervisor) = supervisor.upgrade() else {
            break;
        };

        match AssertUnwindSafe(supervisor.monitor_tick(&cancel))
            .catch_unwind()
            .await
        {
            Ok(TickFlow::Continue) => {}
            Ok(TickFlow::Exit) => break,
            Err(panic) => {
                tracing::error!(
                    panic = %panic_message(panic.as_ref()),
                    "Health monitor tick panicked, continuing"
                );
            }
        }
    }

    tracing::info!("Health monitor stopped");
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}
