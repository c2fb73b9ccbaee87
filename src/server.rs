//! HTTP transport: the chat-completion-compatible surface other agents call.
//!
//! The transport owns the attestation step: it invokes the issuer only after
//! the pipeline has finalized a verdict, then attaches the bundle to the
//! response metadata. Each request gets its own pipeline instance, so sandbox
//! children and isolation environments never outlive the request.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::attestation::AttestationIssuer;
use crate::config::AuditConfig;
use crate::context::RawTransaction;
use crate::pipeline::{AuditFailure, AuditPipeline, CancelToken, FailureClass};
use crate::stages::perception;
use crate::verdict::Verdict;

/// Service name advertised in catalogs and fingerprints.
pub const SERVICE_NAME: &str = "txsentry";

/// Model id advertised on the chat surface.
const MODEL_ID: &str = "txsentry-v1";

#[derive(Debug, Error, Diagnostic)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    #[diagnostic(code(txsentry::server::bind))]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("server error: {0}")]
    #[diagnostic(code(txsentry::server::io))]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    #[diagnostic(code(txsentry::server::attestation))]
    Attestation(#[from] crate::attestation::AttestationError),
}

/// Shared state behind the router.
pub struct AppState {
    pub config: Arc<AuditConfig>,
    pub attestor: AttestationIssuer,
}

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(models))
        .route("/v1/tools", get(tools))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/api/v1/simulate", post(simulate_direct))
        .with_state(state)
}

/// Serve until ctrl-c.
pub async fn serve(config: AuditConfig) -> Result<(), ServerError> {
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState {
        config: Arc::new(config),
        attestor: AttestationIssuer::new(default_fingerprint())?,
    });

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.clone(),
            source,
        })?;
    info!(%addr, "listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;
    Ok(())
}

fn default_fingerprint() -> String {
    std::env::var("TXSENTRY_TEE_FINGERPRINT")
        .unwrap_or_else(|_| "mock_tee_fp_0x5d2a9c8e".to_string())
}

// ── Catalog endpoints ──────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn models() -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": MODEL_ID,
            "object": "model",
            "owned_by": SERVICE_NAME,
        }],
    }))
}

/// The `simulate_tx` tool schema advertised to tool-use clients.
#[must_use]
pub fn simulate_tx_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "simulate_tx",
            "description": "Audit a candidate blockchain transaction against the stated intent inside a forked sandbox and return a SAFE/WARNING/CRITICAL verdict with evidence and an attestation.",
            "parameters": {
                "type": "object",
                "properties": {
                    "user_intent": {
                        "type": "string",
                        "description": "Natural-language description of what the transaction should do",
                    },
                    "chain_id": { "type": "integer", "default": 1 },
                    "tx_from": { "type": "string", "description": "Sender address" },
                    "tx_to": { "type": "string", "description": "Target address" },
                    "tx_value": { "type": "string", "default": "0" },
                    "tx_data": { "type": "string", "default": "0x" },
                },
                "required": ["user_intent", "tx_from", "tx_to"],
            },
        },
    })
}

async fn tools() -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [simulate_tx_tool()],
    }))
}

// ── Chat surface ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Vec<ToolSpec>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallSpec>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ToolSpec {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub function: Option<ToolFunctionSpec>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ToolFunctionSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ToolCallSpec {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    pub function: ToolCallFunction,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ToolCallFunction {
    pub name: String,
    /// Either a JSON object or a JSON-encoded string of one.
    #[serde(default)]
    pub arguments: Value,
}

#[instrument(skip_all)]
async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatCompletionRequest>,
) -> Response {
    let wants_audit = request.tools.iter().any(|tool| {
        tool.function
            .as_ref()
            .is_some_and(|f| f.name == "simulate_tx")
    });
    if !wants_audit {
        return Json(informational_reply(&request)).into_response();
    }

    let (user_intent, raw_tx) = match extract_audit_input(&request) {
        Ok(input) => input,
        Err(message) => return failure_response(&validation_failure(message)),
    };

    // Normalize up front so the tool-call echo carries the canonical form.
    let mut warnings = Vec::new();
    let normalized = match perception::validate_tx(&raw_tx, &mut warnings) {
        Ok(request) => request,
        Err(e) => return failure_response(&validation_failure(e.to_string())),
    };

    let pipeline = AuditPipeline::new(Arc::clone(&state.config));
    match pipeline.run(&user_intent, raw_tx, CancelToken::new()).await {
        Ok(verdict) => {
            let metadata = match state.attestor.response_metadata(
                &verdict,
                &state.config,
                SERVICE_NAME,
            ) {
                Ok(metadata) => metadata,
                Err(e) => {
                    return failure_response(&internal_failure(format!(
                        "attestation failed: {e}"
                    )))
                }
            };
            let arguments = json!({
                "user_intent": user_intent,
                "chain_id": normalized.chain_id,
                "tx_from": normalized.tx_from,
                "tx_to": normalized.tx_to,
                "tx_value": normalized.tx_value,
                "tx_data": normalized.tx_data,
            });
            Json(chat_response(&request, &verdict, metadata, &arguments)).into_response()
        }
        Err(failure) => failure_response(&failure),
    }
}

fn chat_response(
    request: &ChatCompletionRequest,
    verdict: &Verdict,
    attestation: Value,
    arguments: &Value,
) -> Value {
    let mut metadata = attestation;
    metadata["risk_level"] = json!(verdict.risk_level);
    metadata["risk_score"] = json!(verdict.risk_score_percent());

    json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": request.model.clone().unwrap_or_else(|| MODEL_ID.to_string()),
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": verdict.summary.clone(),
                "tool_calls": [{
                    "id": format!("call_{}", Uuid::new_v4().simple()),
                    "type": "function",
                    "function": {
                        "name": "simulate_tx",
                        "arguments": serde_json::to_string(arguments).unwrap_or_default(),
                    },
                }],
            },
            "finish_reason": "tool_calls",
        }],
        "metadata": metadata,
    })
}

fn informational_reply(request: &ChatCompletionRequest) -> Value {
    json!({
        "id": format!("chatcmpl-{}", Uuid::new_v4().simple()),
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": request.model.clone().unwrap_or_else(|| MODEL_ID.to_string()),
        "choices": [{
            "index": 0,
            "message": {
                "role": "assistant",
                "content": "This service audits blockchain transactions. Declare the simulate_tx tool and provide user_intent, tx_from, and tx_to to request an audit.",
            },
            "finish_reason": "stop",
        }],
    })
}

/// Extraction precedence: a `simulate_tx` tool call in the last user message,
/// then an embedded JSON object carrying `tx_from`/`tx_to`, then defaults.
pub fn extract_audit_input(
    request: &ChatCompletionRequest,
) -> Result<(String, RawTransaction), String> {
    let last_user = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .ok_or_else(|| "no user message present".to_string())?;
    let text = message_text(last_user);

    // (1) Explicit tool call.
    if let Some(call) = last_user
        .tool_calls
        .iter()
        .find(|c| c.function.name == "simulate_tx")
    {
        let arguments = decode_arguments(&call.function.arguments)?;
        return raw_from_object(&arguments, text);
    }

    // (2) A JSON object embedded in the message body.
    if let Ok(embedded) = serde_json::from_str::<Value>(text.trim()) {
        if embedded.get("tx_from").is_some() && embedded.get("tx_to").is_some() {
            return raw_from_object(&embedded, text);
        }
    }

    Err("no simulate_tx arguments found in the last user message".to_string())
}

fn message_text(message: &ChatMessage) -> &str {
    match &message.content {
        Some(Value::String(s)) => s,
        Some(Value::Array(parts)) => parts
            .iter()
            .find_map(|p| p.get("text").and_then(Value::as_str))
            .unwrap_or(""),
        _ => "",
    }
}

fn decode_arguments(arguments: &Value) -> Result<Value, String> {
    match arguments {
        Value::String(s) => {
            serde_json::from_str(s).map_err(|e| format!("unreadable tool arguments: {e}"))
        }
        Value::Object(_) => Ok(arguments.clone()),
        _ => Err("tool arguments must be a JSON object".to_string()),
    }
}

fn raw_from_object(object: &Value, fallback_intent: &str) -> Result<(String, RawTransaction), String> {
    let user_intent = object
        .get("user_intent")
        .and_then(Value::as_str)
        .unwrap_or(fallback_intent)
        .to_string();
    let user_intent = if user_intent.trim().is_empty() {
        "Audit this transaction".to_string()
    } else {
        user_intent
    };

    let field = |name: &str| -> Result<String, String> {
        object
            .get(name)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| format!("missing required parameter {name}"))
    };

    let raw = RawTransaction {
        chain_id: object.get("chain_id").and_then(Value::as_u64).unwrap_or(1),
        tx_from: field("tx_from")?,
        tx_to: field("tx_to")?,
        tx_value: object.get("tx_value").cloned().unwrap_or(json!("0")),
        tx_data: object
            .get("tx_data")
            .and_then(Value::as_str)
            .map(str::to_string),
        gas_limit: object.get("gas_limit").and_then(Value::as_u64),
        fork_block: object.get("fork_block").and_then(Value::as_u64),
    };
    Ok((user_intent, raw))
}

// ── Direct audit endpoint ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DirectSimulateRequest {
    pub user_intent: String,
    #[serde(flatten)]
    pub transaction: RawTransaction,
}

#[instrument(skip_all)]
async fn simulate_direct(
    State(state): State<Arc<AppState>>,
    Json(request): Json<DirectSimulateRequest>,
) -> Response {
    let pipeline = AuditPipeline::new(Arc::clone(&state.config));
    match pipeline
        .run(&request.user_intent, request.transaction, CancelToken::new())
        .await
    {
        Ok(verdict) => Json(serde_json::to_value(&verdict).unwrap_or_default()).into_response(),
        Err(failure) => failure_response(&failure),
    }
}

// ── Failure mapping ────────────────────────────────────────────────────

fn validation_failure(message: String) -> AuditFailure {
    AuditFailure {
        class: FailureClass::Validation,
        error_stage: "transport".into(),
        error_message: message,
        user_intent: String::new(),
        execution_history: vec![],
    }
}

fn internal_failure(message: String) -> AuditFailure {
    AuditFailure {
        class: FailureClass::Internal,
        error_stage: "transport".into(),
        error_message: message,
        user_intent: String::new(),
        execution_history: vec![],
    }
}

/// 400 validation / 501 unimplemented backend / 500 everything else.
fn failure_response(failure: &AuditFailure) -> Response {
    let status = match failure.class {
        FailureClass::Validation => StatusCode::BAD_REQUEST,
        FailureClass::Unimplemented => StatusCode::NOT_IMPLEMENTED,
        FailureClass::Timeout | FailureClass::Cancelled | FailureClass::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, Json(failure.to_report())).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_request(json_body: Value) -> ChatCompletionRequest {
        serde_json::from_value(json_body).unwrap()
    }

    #[test]
    fn tool_call_takes_precedence() {
        let request = chat_request(json!({
            "messages": [{
                "role": "user",
                "content": "{\"tx_from\": \"0xaa\", \"tx_to\": \"0xbb\"}",
                "tool_calls": [{
                    "type": "function",
                    "function": {
                        "name": "simulate_tx",
                        "arguments": "{\"user_intent\": \"swap\", \"tx_from\": \"0x11\", \"tx_to\": \"0x22\", \"tx_value\": \"5\"}",
                    },
                }],
            }],
            "tools": [{"type": "function", "function": {"name": "simulate_tx"}}],
        }));
        let (intent, raw) = extract_audit_input(&request).unwrap();
        assert_eq!(intent, "swap");
        assert_eq!(raw.tx_from, "0x11");
        assert_eq!(raw.tx_value, json!("5"));
    }

    #[test]
    fn embedded_json_body_is_second_choice() {
        let request = chat_request(json!({
            "messages": [{
                "role": "user",
                "content": "{\"tx_from\": \"0xaa\", \"tx_to\": \"0xbb\", \"user_intent\": \"send funds\"}",
            }],
        }));
        let (intent, raw) = extract_audit_input(&request).unwrap();
        assert_eq!(intent, "send funds");
        assert_eq!(raw.tx_from, "0xaa");
        assert_eq!(raw.tx_to, "0xbb");
        assert_eq!(raw.chain_id, 1);
    }

    #[test]
    fn plain_text_message_is_an_error() {
        let request = chat_request(json!({
            "messages": [{"role": "user", "content": "please audit something"}],
        }));
        assert!(extract_audit_input(&request).is_err());
    }

    #[test]
    fn missing_required_field_is_reported() {
        let request = chat_request(json!({
            "messages": [{
                "role": "user",
                "tool_calls": [{
                    "function": {
                        "name": "simulate_tx",
                        "arguments": {"user_intent": "swap", "tx_from": "0x11"},
                    },
                }],
            }],
        }));
        let err = extract_audit_input(&request).unwrap_err();
        assert!(err.contains("tx_to"));
    }

    #[test]
    fn object_arguments_accepted_without_string_encoding() {
        let request = chat_request(json!({
            "messages": [{
                "role": "user",
                "tool_calls": [{
                    "function": {
                        "name": "simulate_tx",
                        "arguments": {
                            "user_intent": "stake",
                            "tx_from": "0x11",
                            "tx_to": "0x22",
                            "tx_value": 1.5,
                        },
                    },
                }],
            }],
        }));
        let (_, raw) = extract_audit_input(&request).unwrap();
        assert!(raw.tx_value.is_f64());
    }

    #[test]
    fn tool_catalog_advertises_simulate_tx() {
        let tool = simulate_tx_tool();
        assert_eq!(tool["function"]["name"], "simulate_tx");
        let required = tool["function"]["parameters"]["required"]
            .as_array()
            .unwrap();
        assert!(required.contains(&json!("tx_from")));
        assert!(required.contains(&json!("tx_to")));
        assert!(required.contains(&json!("user_intent")));
    }
}
