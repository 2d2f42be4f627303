//! Cached view of the pool's `/stats` endpoint.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::{Endpoint, InvalidEndpoint};
use crate::version::user_agent;

/// How long a snapshot is served before the next fetch.
pub const DEFAULT_STATUS_TTL: Duration = Duration::from_secs(5);

/// Bound on one `/stats` request.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Pool statistics as of one fetch. All metrics are zero when disconnected.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub connected_miners: u32,
    pub total_shares: u64,
    pub pool_hashrate: f64,
    pub share_difficulty: u64,
    pub last_share_timestamp: i64,
    pub network_difficulty: u64,
    pub effort_percent: f64,
    /// Set by the cache when this snapshot was stored.
    pub refreshed_at: Option<DateTime<Utc>>,
}

/// Produces a fresh snapshot. Never fails; unreachable means disconnected.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self) -> StatusSnapshot;
}

pub struct HttpStatusSource {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpStatusSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            timeout,
        }
    }

    /// `/stats` on the pool at `pool_url` (e.g. `http://127.0.0.1:37889`).
    pub fn from_pool_url(pool_url: &str) -> Result<Self, InvalidEndpoint> {
        let endpoint = Endpoint::parse(pool_url)?;
        Ok(Self::new(endpoint.url("/stats"), DEFAULT_FETCH_TIMEOUT))
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_body(&self) -> Result<String, reqwest::Error> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::USER_AGENT, user_agent())
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        if status != 200 {
            tracing::debug!(status, url = %self.url, "Pool stats returned non-200");
            return Ok(String::new());
        }
        response.text().await
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch(&self) -> StatusSnapshot {
        let body = match self.fetch_body().await {
            Ok(body) => body,
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Pool stats fetch failed");
                return StatusSnapshot::default();
            }
        };

        if body.is_empty() {
            return StatusSnapshot::default();
        }

        match serde_json::from_str::<Value>(&body) {
            Ok(stats) => parse_stats(&stats),
            Err(e) => {
                tracing::debug!(url = %self.url, error = %e, "Pool stats body is not JSON");
                StatusSnapshot::default()
            }
        }
    }
}

fn u64_of(value: Option<&Value>) -> Option<u64> {
    value.and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f as u64)))
}

/// First key present as a number wins.
fn first_u64(stats: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter().find_map(|key| u64_of(stats.get(*key)))
}

fn first_f64(stats: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|key| stats.get(*key).and_then(Value::as_f64))
}

/// Lenient extraction from a parsed `/stats` body.
///
/// Any JSON counts as connected; fields are only read from an object.
pub fn parse_stats(stats: &Value) -> StatusSnapshot {
    let mut snapshot = StatusSnapshot {
        connected: true,
        ..StatusSnapshot::default()
    };

    if !stats.is_object() {
        return snapshot;
    }

    let connections = match stats.get("connections") {
        Some(Value::Object(nested)) => u64_of(nested.get("incoming")),
        flat => u64_of(flat),
    };
    snapshot.connected_miners = connections.map_or(0, |n| u32::try_from(n).unwrap_or(u32::MAX));

    snapshot.total_shares = first_u64(stats, &["shares_found"]).unwrap_or_default();
    snapshot.pool_hashrate = first_f64(stats, &["pool_hashrate", "hashrate"]).unwrap_or_default();
    snapshot.share_difficulty =
        first_u64(stats, &["current_share_diff", "sidechain_difficulty"]).unwrap_or_default();
    snapshot.last_share_timestamp = stats
        .get("last_share_timestamp")
        .and_then(Value::as_i64)
        .unwrap_or_default();
    snapshot.network_difficulty =
        first_u64(stats, &["network_difficulty", "mainchain_difficulty"]).unwrap_or_default();
    snapshot.effort_percent = first_f64(stats, &["pool_effort"]).unwrap_or_default();

    if snapshot.connected_miners == 0
        && let Some(miners) = u64_of(stats.get("stratum").and_then(|s| s.get("connections")))
    {
        snapshot.connected_miners = u32::try_from(miners).unwrap_or(u32::MAX);
    }

    snapshot
}

struct Cached {
    fetched: Instant,
    snapshot: StatusSnapshot,
}

/// TTL cache in front of a [`StatusSource`].
///
/// One lock covers check-and-fetch, so concurrent callers at expiry share a
/// single fetch and never see a half-written snapshot.
pub struct StatusCache {
    source: Arc<dyn StatusSource>,
    ttl: Duration,
    inner: Mutex<Option<Cached>>,
}

impl StatusCache {
    pub fn new(source: Arc<dyn StatusSource>) -> Self {
        Self::with_ttl(source, DEFAULT_STATUS_TTL)
    }

    pub fn with_ttl(source: Arc<dyn StatusSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            inner: Mutex::new(None),
        }
    }

    /// Cached snapshot if younger than the TTL, otherwise a fresh one.
    pub async fn get_status(&self) -> StatusSnapshot {
        let mut inner = self.inner.lock().await;
        if let Some(cached) = inner.as_ref()
            && cached.fetched.elapsed() < self.ttl
        {
            return cached.snapshot.clone();
        }
        self.fetch_into(&mut inner).await
    }

    /// Fetch now regardless of age.
    pub async fn refresh_status(&self) -> StatusSnapshot {
        let mut inner = self.inner.lock().await;
        self.fetch_into(&mut inner).await
    }

    pub async fn is_ready(&self) -> bool {
        self.get_status().await.connected
    }

    async fn fetch_into(&self, slot: &mut Option<Cached>) -> StatusSnapshot {
        let mut snapshot = self.source.fetch().await;
        snapshot.refreshed_at = Some(Utc::now());
        *slot = Some(Cached {
            fetched: Instant::now(),
            snapshot: snapshot.clone(),
        });
        snapshot
    }
}
