// src/rpc_client.rs
//
// JSON-RPC 2.0 transport over a shared pooled HTTP client, plus the error
// taxonomy the retry policy keys its backoff decisions on. The transport is
// a trait so failure-injection tests can script it without a live endpoint.

use async_trait::async_trait;
use ethers::types::{Address, Bytes};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;

use crate::abi::decode_response_hex;

/// Classified failure kinds; each maps to a distinct backoff strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RpcErrorKind {
    /// HTTP 429 or a rate-related JSON-RPC error message.
    RateLimited,
    /// HTTP 5xx or a JSON-RPC internal error (-32000 family).
    ServerError,
    /// Malformed request (-32602, HTTP 4xx); retrying cannot help.
    InvalidRequest,
    /// Connection / timeout failures below the HTTP layer.
    Transport,
    /// Syntactically broken or result-less response body.
    InvalidResponse,
    /// Anything that resists classification.
    Unknown,
}

/// A classified RPC failure from one endpoint.
#[derive(Debug, Error, Clone)]
#[error("rpc {kind:?} from {endpoint}: {message}")]
pub struct RpcError {
    pub kind: RpcErrorKind,
    pub endpoint: String,
    pub message: String,
    /// Server-provided wait hint, only ever set for rate limits.
    pub retry_after: Option<Duration>,
}

impl RpcError {
    pub fn new(kind: RpcErrorKind, endpoint: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.to_string(),
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(endpoint: &str, retry_after: Option<Duration>) -> Self {
        Self {
            kind: RpcErrorKind::RateLimited,
            endpoint: endpoint.to_string(),
            message: "rate limited".to_string(),
            retry_after,
        }
    }
}

/// One call of a JSON-RPC batch envelope.
#[derive(Debug, Clone)]
pub struct BatchCall {
    pub method: String,
    pub params: Value,
}

impl BatchCall {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a Value,
    id: u64,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorObject>,
}

#[derive(Deserialize)]
struct JsonRpcErrorObject {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

/// Wire seam for JSON-RPC execution. Production uses [`HttpTransport`];
/// tests use scripted implementations.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Executes one JSON-RPC call and returns its `result` value.
    async fn call(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, RpcError>;

    /// Executes a batch envelope; slot `i` of the output carries the result
    /// of `calls[i]`, matched back by request id (never by arrival order),
    /// or `None` if that call errored inside an otherwise successful batch.
    async fn call_batch(
        &self,
        endpoint: &str,
        calls: &[BatchCall],
    ) -> Result<Vec<Option<Value>>, RpcError>;
}

/// Shared pooled HTTP JSON-RPC transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Builds the shared client with a bounded connection pool and a hard
    /// per-request timeout.
    pub fn new(request_timeout: Duration, max_idle_per_host: usize) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .user_agent("reserve-lens/0.1")
            .build()?;
        Ok(Self { client })
    }

    async fn post_json(&self, endpoint: &str, body: &Value) -> Result<Value, RpcError> {
        let response = self
            .client
            .post(endpoint)
            .json(body)
            .send()
            .await
            .map_err(|e| classify_send_error(endpoint, &e))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(RpcError::rate_limited(endpoint, retry_after));
        }
        if status.is_server_error() {
            return Err(RpcError::new(
                RpcErrorKind::ServerError,
                endpoint,
                format!("server error {}", status),
            ));
        }
        if status.is_client_error() {
            return Err(RpcError::new(
                RpcErrorKind::InvalidRequest,
                endpoint,
                format!("client error {}", status),
            ));
        }

        response.json::<Value>().await.map_err(|e| {
            RpcError::new(
                RpcErrorKind::InvalidResponse,
                endpoint,
                format!("invalid JSON body: {}", e),
            )
        })
    }
}

#[async_trait]
impl RpcTransport for HttpTransport {
    async fn call(&self, endpoint: &str, method: &str, params: Value) -> Result<Value, RpcError> {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method,
            params: &params,
            id: 1,
        };
        let body = serde_json::to_value(&request).expect("request serializes");
        let raw = self.post_json(endpoint, &body).await?;

        let parsed: JsonRpcResponse = serde_json::from_value(raw).map_err(|e| {
            RpcError::new(
                RpcErrorKind::InvalidResponse,
                endpoint,
                format!("malformed JSON-RPC frame: {}", e),
            )
        })?;

        if let Some(error) = parsed.error {
            return Err(classify_rpc_error(endpoint, &error));
        }
        parsed.result.ok_or_else(|| {
            RpcError::new(RpcErrorKind::InvalidResponse, endpoint, "no result in response")
        })
    }

    async fn call_batch(
        &self,
        endpoint: &str,
        calls: &[BatchCall],
    ) -> Result<Vec<Option<Value>>, RpcError> {
        if calls.is_empty() {
            return Ok(Vec::new());
        }

        let envelope: Vec<Value> = calls
            .iter()
            .enumerate()
            .map(|(i, call)| {
                json!({
                    "jsonrpc": "2.0",
                    "method": call.method,
                    "params": call.params,
                    "id": i as u64,
                })
            })
            .collect();

        let raw = self.post_json(endpoint, &Value::Array(envelope)).await?;
        map_batch_frames(endpoint, raw, calls.len())
    }
}

/// Maps a batch response body back to positional slots by request id,
/// never by arrival order, since providers may reorder frames.
fn map_batch_frames(
    endpoint: &str,
    raw: Value,
    expected: usize,
) -> Result<Vec<Option<Value>>, RpcError> {
    // Some providers unwrap single-element batches into a bare object.
    let frames: Vec<Value> = match raw {
        Value::Array(frames) => frames,
        single @ Value::Object(_) => vec![single],
        other => {
            return Err(RpcError::new(
                RpcErrorKind::InvalidResponse,
                endpoint,
                format!("unexpected batch response shape: {}", other),
            ))
        }
    };

    let mut results: Vec<Option<Value>> = vec![None; expected];
    for frame in frames {
        let parsed: JsonRpcResponse = match serde_json::from_value(frame) {
            Ok(p) => p,
            Err(e) => {
                debug!("Skipping malformed batch frame from {}: {}", endpoint, e);
                continue;
            }
        };
        let Some(id) = parsed.id else { continue };
        let slot = id as usize;
        if slot >= results.len() {
            debug!("Batch frame id {} out of range from {}", id, endpoint);
            continue;
        }
        if let Some(error) = parsed.error {
            // Rate limits inside the envelope still abort the whole batch
            // so the retry policy can back off properly.
            let classified = classify_rpc_error(endpoint, &error);
            if classified.kind == RpcErrorKind::RateLimited {
                return Err(classified);
            }
            debug!(
                "Batch call {} failed on {}: {} ({})",
                id, endpoint, error.message, error.code
            );
            continue;
        }
        results[slot] = parsed.result;
    }
    Ok(results)
}

fn classify_send_error(endpoint: &str, error: &reqwest::Error) -> RpcError {
    let message = if error.is_timeout() {
        format!("timeout: {}", error)
    } else if error.is_connect() {
        format!("connection error: {}", error)
    } else {
        format!("transport error: {}", error)
    };
    RpcError::new(RpcErrorKind::Transport, endpoint, message)
}

fn classify_rpc_error(endpoint: &str, error: &JsonRpcErrorObject) -> RpcError {
    let lowered = error.message.to_lowercase();
    let kind = if error.code == -32602 {
        RpcErrorKind::InvalidRequest
    } else if error.code == -32000 {
        RpcErrorKind::ServerError
    } else if lowered.contains("rate") || lowered.contains("limit") {
        RpcErrorKind::RateLimited
    } else {
        RpcErrorKind::Unknown
    };
    if kind == RpcErrorKind::RateLimited {
        warn!("Rate-limit error reported by {}: {}", endpoint, error.message);
    }
    RpcError::new(
        kind,
        endpoint,
        format!("RPC error {}: {}", error.code, error.message),
    )
}

/// `eth_call` params for a read call against `to` at the latest block.
pub fn eth_call_params(to: Address, data: &Bytes) -> Value {
    json!([
        {
            "to": format!("{:?}", to),
            "data": format!("0x{}", hex::encode(data)),
        },
        "latest"
    ])
}

/// Extracts the raw bytes from a hex-string `eth_call` result value.
pub fn result_bytes(endpoint: &str, value: &Value) -> Result<Vec<u8>, RpcError> {
    let text = value.as_str().ok_or_else(|| {
        RpcError::new(
            RpcErrorKind::InvalidResponse,
            endpoint,
            "eth_call result is not a string",
        )
    })?;
    decode_response_hex(text).map_err(|e| {
        RpcError::new(RpcErrorKind::InvalidResponse, endpoint, e.to_string())
    })
}
