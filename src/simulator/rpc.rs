//! Minimal JSON-RPC 2.0 client used to drive the sandbox node.
//!
//! Only the handful of methods the simulator needs are wrapped; everything
//! rides over a shared [`reqwest::Client`] against a loopback endpoint.

use miette::Diagnostic;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the JSON-RPC layer.
#[derive(Debug, Error, Diagnostic)]
pub enum RpcError {
    #[error("rpc transport error calling {method}: {message}")]
    #[diagnostic(code(txsentry::rpc::transport))]
    Transport { method: String, message: String },

    #[error("rpc node rejected {method}: {message} (code {code})")]
    #[diagnostic(code(txsentry::rpc::node))]
    Node {
        method: String,
        code: i64,
        message: String,
    },

    #[error("malformed rpc response for {method}: {message}")]
    #[diagnostic(code(txsentry::rpc::malformed))]
    Malformed { method: String, message: String },

    #[error("rpc call {method} timed out after {seconds:.1}s")]
    #[diagnostic(code(txsentry::rpc::timeout))]
    Timeout { method: String, seconds: f64 },
}

/// JSON-RPC client bound to one endpoint.
#[derive(Debug)]
pub struct RpcClient {
    http: reqwest::Client,
    endpoint: String,
    next_id: AtomicU64,
    call_timeout: Duration,
}

impl RpcClient {
    #[must_use]
    pub fn new(endpoint: impl Into<String>, call_timeout: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            next_id: AtomicU64::new(1),
            call_timeout,
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Issue one JSON-RPC call and decode the `result` member.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let send = self.http.post(&self.endpoint).json(&body).send();
        let response = tokio::time::timeout(self.call_timeout, send)
            .await
            .map_err(|_| RpcError::Timeout {
                method: method.to_string(),
                seconds: self.call_timeout.as_secs_f64(),
            })?
            .map_err(|e| RpcError::Transport {
                method: method.to_string(),
                message: e.to_string(),
            })?;

        let envelope: Value = response.json().await.map_err(|e| RpcError::Malformed {
            method: method.to_string(),
            message: e.to_string(),
        })?;

        if let Some(error) = envelope.get("error").filter(|e| !e.is_null()) {
            return Err(RpcError::Node {
                method: method.to_string(),
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown node error")
                    .to_string(),
            });
        }

        let result = envelope
            .get("result")
            .cloned()
            .ok_or_else(|| RpcError::Malformed {
                method: method.to_string(),
                message: "response missing 'result'".into(),
            })?;
        serde_json::from_value(result).map_err(|e| RpcError::Malformed {
            method: method.to_string(),
            message: e.to_string(),
        })
    }
}

/// Decode an `0x`-prefixed quantity into a `u128`.
pub fn decode_quantity(raw: &str) -> Result<u128, RpcError> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    let digits = if digits.is_empty() { "0" } else { digits };
    u128::from_str_radix(digits, 16).map_err(|e| RpcError::Malformed {
        method: "quantity".into(),
        message: format!("{raw:?}: {e}"),
    })
}

/// Encode a quantity as the minimal `0x` hex form the node expects.
#[must_use]
pub fn encode_quantity(value: u128) -> String {
    format!("0x{value:x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantity_round_trip() {
        assert_eq!(encode_quantity(0), "0x0");
        assert_eq!(encode_quantity(31337), "0x7a69");
        assert_eq!(decode_quantity("0x7a69").unwrap(), 31337);
        assert_eq!(decode_quantity("0x0").unwrap(), 0);
        assert_eq!(decode_quantity("0x").unwrap(), 0);
    }

    #[test]
    fn quantity_rejects_garbage() {
        assert!(decode_quantity("0xzz").is_err());
    }
}
