//! JSON-RPC client for the pool process.
//!
//! Every call is a fresh `POST /` with a bounded timeout. Nothing here retries;
//! callers decide what to do with a failure.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Value, json};

use crate::config::{Endpoint, InvalidEndpoint};
use crate::version::user_agent;

/// Default bound on one RPC round trip.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(10);

/// Substituted when a template omits `target`. Maximal value, i.e. any hash
/// meets it; not derived from the template difficulty.
pub const FALLBACK_TARGET: &str =
    "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff";

const TEMPLATE_METHOD: &str = "get_share_template";
const SUBMIT_METHOD: &str = "submit_share";

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The configured URL has no usable host or port.
    #[error(transparent)]
    InvalidUrl(#[from] InvalidEndpoint),
    /// Connect, send or read failed, including timeouts. No HTTP status.
    #[error("couldn't connect to p2pool server: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("server returned HTTP error {status}")]
    HttpStatus { status: u16 },
    /// Body is not a JSON-RPC reply object.
    #[error("couldn't parse reply from server: {0}")]
    Malformed(String),
    /// Contents of a non-null `error` field.
    #[error("RPC error: {0}")]
    Remote(Value),
    /// A required template field is absent or has the wrong type.
    #[error("reply missing field '{0}'")]
    MissingField(&'static str),
}

impl RpcError {
    /// HTTP status for non-200 replies.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status } => Some(*status),
            _ => None,
        }
    }

    /// True when no HTTP exchange completed (refused, reset, timed out).
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Work unit handed out by the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockTemplate {
    pub header_hex: String,
    pub seed_hash: String,
    pub difficulty: u64,
    pub height: u64,
    pub target: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareStatus {
    Accepted,
    Rejected,
    Stale,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShareResult {
    pub status: ShareStatus,
    pub message: String,
}

impl ShareResult {
    fn new(status: ShareStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

/// JSON-RPC client bound to one pool endpoint and payout wallet.
pub struct RpcClient {
    client: reqwest::Client,
    endpoint: Endpoint,
    url: String,
    wallet_address: String,
    timeout: Duration,
}

impl RpcClient {
    /// Resolve `url` (scheme optional, port defaults to the pool port) once.
    pub fn new(url: &str, wallet_address: impl Into<String>) -> Result<Self, RpcError> {
        let endpoint = Endpoint::parse(url)?;

        // No idle connections are kept: one connection per call.
        let client = reqwest::Client::builder()
            .user_agent(user_agent())
            .pool_max_idle_per_host(0)
            .build()
            .map_err(RpcError::Transport)?;

        Ok(Self {
            client,
            url: endpoint.url("/"),
            endpoint,
            wallet_address: wallet_address.into(),
            timeout: DEFAULT_RPC_TIMEOUT,
        })
    }

    /// Bound on each call, connect through body. Defaults to [`DEFAULT_RPC_TIMEOUT`].
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Host and port resolved at construction.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Issue one JSON-RPC request and return its `result` (`null` if absent).
    pub async fn call_method(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let request = json!({
            "method": method,
            "params": params,
            "id": 1,
        });

        let response = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(RpcError::Transport)?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(RpcError::HttpStatus { status });
        }

        let body = response.text().await.map_err(RpcError::Transport)?;
        let mut reply: Value =
            serde_json::from_str(&body).map_err(|e| RpcError::Malformed(e.to_string()))?;

        let Some(object) = reply.as_object_mut() else {
            return Err(RpcError::Malformed("expected reply to be an object".to_string()));
        };
        if object.is_empty() {
            return Err(RpcError::Malformed("expected reply to have result".to_string()));
        }

        match object.remove("error") {
            Some(Value::Null) | None => {}
            Some(error) => return Err(RpcError::Remote(error)),
        }

        Ok(object.remove("result").unwrap_or(Value::Null))
    }

    /// Fetch a work template for the configured wallet.
    ///
    /// Failures are logged and collapse to `None`; use
    /// [`fetch_block_template`](Self::fetch_block_template) to see the error.
    pub async fn block_template(&self) -> Option<BlockTemplate> {
        match self.fetch_block_template().await {
            Ok(template) => Some(template),
            Err(e) => {
                tracing::warn!(method = TEMPLATE_METHOD, error = %e, "Block template request failed");
                None
            }
        }
    }

    /// Like [`block_template`](Self::block_template) but surfaces the error.
    pub async fn fetch_block_template(&self) -> Result<BlockTemplate, RpcError> {
        let result = self
            .call_method(TEMPLATE_METHOD, json!([self.wallet_address]))
            .await?;
        parse_template(&result)
    }

    /// Submit a solved header. Never fails; errors become [`ShareStatus::Error`].
    ///
    /// A reply without a recognised `status` is reported as accepted. An
    /// ambiguous reply is therefore indistinguishable from a real acceptance.
    pub async fn submit_share(&self, header_hex: &str) -> ShareResult {
        let outcome = self
            .call_method(SUBMIT_METHOD, json!([header_hex, self.wallet_address]))
            .await
            .and_then(|result| classify_submission(&result));

        match outcome {
            Ok(result) => {
                tracing::debug!(status = ?result.status, message = %result.message, "Share submitted");
                result
            }
            Err(e) => {
                tracing::warn!(method = SUBMIT_METHOD, error = %e, "Share submission failed");
                ShareResult::new(ShareStatus::Error, format!("Error: {e}"))
            }
        }
    }
}

fn str_field<'a>(result: &'a Value, key: &'static str) -> Result<&'a str, RpcError> {
    result
        .get(key)
        .and_then(Value::as_str)
        .ok_or(RpcError::MissingField(key))
}

fn u64_field(result: &Value, key: &'static str) -> Result<u64, RpcError> {
    result
        .get(key)
        .and_then(Value::as_u64)
        .ok_or(RpcError::MissingField(key))
}

fn parse_template(result: &Value) -> Result<BlockTemplate, RpcError> {
    let header_hex = if result.get("blocktemplate_blob").is_some() {
        str_field(result, "blocktemplate_blob")?
    } else {
        str_field(result, "header")?
    };

    let target = match result.get("target") {
        Some(Value::Null) | None => FALLBACK_TARGET,
        Some(_) => str_field(result, "target")?,
    };

    Ok(BlockTemplate {
        header_hex: header_hex.to_string(),
        seed_hash: str_field(result, "seed_hash")?.to_string(),
        difficulty: u64_field(result, "difficulty")?,
        height: u64_field(result, "height")?,
        target: target.to_string(),
    })
}

fn classify_submission(result: &Value) -> Result<ShareResult, RpcError> {
    let object = match result {
        Value::Object(object) => object,
        Value::Bool(true) => return Ok(ShareResult::new(ShareStatus::Accepted, "Share accepted")),
        _ => return Ok(ShareResult::new(ShareStatus::Accepted, "Share submitted")),
    };

    let Some(status) = object.get("status") else {
        return Ok(ShareResult::new(ShareStatus::Accepted, "Share accepted"));
    };
    let status = status
        .as_str()
        .ok_or_else(|| RpcError::Malformed(format!("share status is not a string: {status}")))?;

    let message = object
        .get("message")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty());

    let (status, default_message) = match status {
        "accepted" => (ShareStatus::Accepted, "Share accepted"),
        "rejected" => (ShareStatus::Rejected, "Share rejected"),
        "stale" => (ShareStatus::Stale, "Share stale"),
        _ => return Ok(ShareResult::new(ShareStatus::Accepted, "Share submitted")),
    };

    Ok(ShareResult::new(status, message.unwrap_or(default_message)))
}
