//! The interceptor (§4.1): sequences an inbound tool call through the
//! policy engine, then — if admitted — forwards it to the downstream
//! tool-execution server and correlates the eventual response back to the
//! waiting caller.
//!
//! Downstream framing is newline-delimited JSON-RPC over the child
//! process's stdio, the same shape MCP servers speak. Each forwarded
//! request gets a fresh id; a `DashMap<String, oneshot::Sender<..>>` holds
//! the pending replies so the reader task (which owns the child's stdout)
//! can resolve the right caller without a central lock.

use crate::anomaly::AnomalyDetector;
use crate::audit::AuditLog;
use crate::circuit_breaker::CircuitBreaker;
use crate::policy::PolicyEngine;
use crate::store::Store;
use crate::types::{PolicyContext, PolicyVerdict, ResponseStatus, Value};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error};

pub const FORWARD_TIMEOUT: Duration = Duration::from_millis(15_000);

/// JSON-RPC-style error codes surfaced in the sentinel's reply (§6),
/// distinct from whatever the downstream process itself returns.
pub const ERROR_CODE_POLICY_VIOLATION: i32 = -32000;
pub const ERROR_CODE_CONFIRMATION_REQUIRED: i32 = -32001;
pub const ERROR_CODE_REQUEST_TIMEOUT: i32 = -32002;

const DEFAULT_HOST: &str = "local";
const DEFAULT_AGENT: &str = "unknown";
const JSONRPC_VERSION: &str = "2.0";
const METHOD_TOOLS_CALL: &str = "tools/call";

const MESSAGE_POLICY_VIOLATION: &str = "Policy violation";
const MESSAGE_CONFIRMATION_REQUIRED: &str = "Confirmation required";
const MESSAGE_REQUEST_TIMEOUT: &str = "Request timeout";

/// The inbound JSON-RPC 2.0 envelope (§4.1/§6). Only `method: "tools/call"`
/// enters the policy pipeline; every other method (handshakes, pings,
/// `initialize`, ...) passes through to the downstream process unmodified
/// and uncorrelated.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    #[serde(default)]
    pub id: Option<serde_json::Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub params: Option<serde_json::Value>,
}

/// `params` of a `tools/call` envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolCallParams {
    pub name: String,
    #[serde(default = "Value::empty_map")]
    pub arguments: Value,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default, rename = "confirmationToken")]
    pub confirmation_token: Option<String>,
}

/// A `tools/call` request, resolved from the JSON-RPC envelope's `id` and
/// `params` into the shape the policy pipeline operates on.
#[derive(Debug, Clone)]
pub struct ToolCallRequest {
    pub id: serde_json::Value,
    pub tool: String,
    pub host: Option<String>,
    pub agent: Option<String>,
    pub arguments: Value,
    pub confirmation_token: Option<String>,
}

impl ToolCallRequest {
    /// `host` defaults from `arguments.host` and `agent` from
    /// `arguments.agent` when the inbound request omits them outright,
    /// rather than failing the request. Operators relying on this default
    /// should know it is permissive by construction — rules that key on
    /// host or agent should not assume every call named one explicitly.
    fn resolved_host(&self) -> String {
        self.host.clone().unwrap_or_else(|| {
            self.arguments
                .as_map()
                .and_then(|m| m.get("host"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| DEFAULT_HOST.to_string())
        })
    }

    fn resolved_agent(&self) -> String {
        self.agent.clone().unwrap_or_else(|| {
            self.arguments
                .as_map()
                .and_then(|m| m.get("agent"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| DEFAULT_AGENT.to_string())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ToolCallOutcome {
    Forwarded {
        response: Value,
    },
    Denied {
        code: i32,
        message: String,
        reason: String,
        risk_score: f64,
        risk_factors: Vec<crate::types::RiskFactor>,
        retry_after_seconds: Option<u64>,
    },
    AskConfirmation {
        code: i32,
        message: String,
        token: String,
        reason: String,
        risk_score: f64,
        risk_factors: Vec<crate::types::RiskFactor>,
    },
    DownstreamError {
        message: String,
    },
    DownstreamTimeout {
        code: i32,
        message: String,
    },
}

/// Builds the JSON-RPC 2.0 reply for a `tools/call` envelope's `id`, per the
/// wire shapes pinned in §6: success carries `result`, every denial carries
/// `error.data` with the reason/risk evidence, timeout carries a bare
/// `error` with no `data`.
fn jsonrpc_reply(id: serde_json::Value, outcome: ToolCallOutcome) -> serde_json::Value {
    match outcome {
        ToolCallOutcome::Forwarded { response } => serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "result": response.to_json(),
        }),
        ToolCallOutcome::Denied { code, message, reason, risk_score, risk_factors, .. } => serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": {
                "code": code,
                "message": message,
                "data": {
                    "reason": reason,
                    "riskScore": risk_score,
                    "riskFactors": risk_factors,
                },
            },
        }),
        ToolCallOutcome::AskConfirmation { code, message, token, reason, risk_score, risk_factors } => serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": {
                "code": code,
                "message": message,
                "data": {
                    "reason": reason,
                    "confirmationToken": token,
                    "riskScore": risk_score,
                    "riskFactors": risk_factors,
                },
            },
        }),
        ToolCallOutcome::DownstreamError { message } => serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": {
                "code": ERROR_CODE_POLICY_VIOLATION,
                "message": message,
            },
        }),
        ToolCallOutcome::DownstreamTimeout { code, message } => serde_json::json!({
            "jsonrpc": JSONRPC_VERSION,
            "id": id,
            "error": {
                "code": code,
                "message": message,
            },
        }),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFrame {
    id: String,
    tool: String,
    arguments: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireReply {
    id: String,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

struct PendingReply {
    sender: oneshot::Sender<WireReply>,
}

/// Owns the downstream child process and the request/reply correlation
/// table. One instance per downstream server.
pub struct Interceptor {
    store: Arc<Store>,
    policy: PolicyEngine,
    audit: AuditLog,
    circuit_breaker: CircuitBreaker,
    anomaly: AnomalyDetector,
    child_stdin: Mutex<tokio::process::ChildStdin>,
    pending: Arc<DashMap<String, PendingReply>>,
    next_request_id: AtomicU64,
    last_tool_by_agent_host: DashMap<(String, String), String>,
    /// Downstream reply lines that did not correlate to a pending
    /// `tools/call` forward — i.e. replies to passed-through envelopes.
    /// `serve` relays these back to the caller uncorrelated, per §4.1.
    passthrough_rx: Mutex<tokio::sync::mpsc::UnboundedReceiver<String>>,
}

impl Interceptor {
    /// Spawns the downstream server and starts the background reader task
    /// that demultiplexes its stdout back to pending callers.
    pub async fn spawn(store: Arc<Store>, command: &str, args: &[String]) -> std::io::Result<(Self, Child)> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");

        let pending: Arc<DashMap<String, PendingReply>> = Arc::new(DashMap::new());
        let reader_pending = pending.clone();
        let (passthrough_tx, passthrough_rx) = tokio::sync::mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<WireReply>(&line) {
                            Ok(reply) if reader_pending.contains_key(&reply.id) => {
                                if let Some((_, entry)) = reader_pending.remove(&reply.id) {
                                    let _ = entry.sender.send(reply);
                                }
                            }
                            _ => {
                                // Doesn't correlate to a pending tool-call forward;
                                // it's a reply to a passed-through envelope. Relay
                                // it back to the caller unmodified and uncorrelated.
                                if passthrough_tx.send(line).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Ok(None) => {
                        debug!("downstream stdout closed");
                        break;
                    }
                    Err(e) => {
                        error!(error = %e, "error reading downstream stdout");
                        break;
                    }
                }
            }
        });

        let interceptor = Self {
            circuit_breaker: CircuitBreaker::new(store.clone(), Default::default()),
            anomaly: AnomalyDetector::new(store.clone()),
            policy: PolicyEngine::new(store.clone()),
            audit: AuditLog::new(store.clone()),
            store,
            child_stdin: Mutex::new(stdin),
            pending,
            next_request_id: AtomicU64::new(1),
            last_tool_by_agent_host: DashMap::new(),
            passthrough_rx: Mutex::new(passthrough_rx),
        };

        Ok((interceptor, child))
    }

    /// Runs one tool call through the full pipeline: policy decision, audit
    /// write, and — if admitted — forwarding to the downstream process with
    /// a bounded wait for the correlated reply.
    pub async fn handle(&self, request: ToolCallRequest) -> Result<ToolCallOutcome, crate::error::SentinelError> {
        let now_ms = PolicyContext::now_ms();
        let host = request.resolved_host();
        let agent = request.resolved_agent();
        let key = (agent.clone(), host.clone());
        let previous_tool = self.last_tool_by_agent_host.get(&key).map(|v| v.clone());

        let ctx = PolicyContext {
            tool: request.tool.clone(),
            host: host.clone(),
            agent: agent.clone(),
            arguments: request.arguments.clone(),
            timestamp_ms: now_ms,
            confirmation_token: request.confirmation_token.clone(),
        };

        let mode = self.store.get_mode().await?;
        let verdict: PolicyVerdict = self
            .policy
            .evaluate(&ctx, previous_tool.as_deref(), now_ms)
            .await?;

        let entry = self
            .audit
            .record(&ctx.tool, &ctx.host, &ctx.agent, &ctx.arguments, &verdict, mode.as_str(), now_ms)
            .await?;

        if verdict.requires_confirmation {
            self.audit
                .record_response(entry.sequence_number, ResponseStatus::Error.as_str(), Some(MESSAGE_CONFIRMATION_REQUIRED))
                .await?;
            return Ok(ToolCallOutcome::AskConfirmation {
                code: ERROR_CODE_CONFIRMATION_REQUIRED,
                message: MESSAGE_CONFIRMATION_REQUIRED.to_string(),
                token: verdict.confirmation_token.unwrap_or_default(),
                reason: verdict.reason,
                risk_score: verdict.risk_score,
                risk_factors: verdict.risk_factors,
            });
        }

        if !verdict.allowed {
            self.audit
                .record_response(entry.sequence_number, ResponseStatus::Error.as_str(), Some(verdict.reason.as_str()))
                .await?;
            return Ok(ToolCallOutcome::Denied {
                code: ERROR_CODE_POLICY_VIOLATION,
                message: MESSAGE_POLICY_VIOLATION.to_string(),
                reason: verdict.reason,
                risk_score: verdict.risk_score,
                risk_factors: verdict.risk_factors,
                retry_after_seconds: verdict.retry_after_seconds,
            });
        }

        self.last_tool_by_agent_host.insert(key, request.tool.clone());

        let outcome = self.forward(&request).await;

        let (status, error_message) = match &outcome {
            Ok(ToolCallOutcome::Forwarded { .. }) => (ResponseStatus::Success, None),
            Ok(ToolCallOutcome::DownstreamTimeout { .. }) => (ResponseStatus::Timeout, None),
            Ok(ToolCallOutcome::DownstreamError { message }) => (ResponseStatus::Error, Some(message.clone())),
            _ => (ResponseStatus::Error, None),
        };
        self.audit
            .record_response(entry.sequence_number, status.as_str(), error_message.as_deref())
            .await?;

        let is_error = status != ResponseStatus::Success;
        self.circuit_breaker
            .record_outcome(&ctx.host, is_error, now_ms)
            .await?;
        self.anomaly
            .record_observation(
                &ctx.tool,
                &ctx.host,
                previous_tool.as_deref(),
                &ctx.arguments,
                now_ms,
                is_error,
            )
            .await?;

        outcome.map_err(crate::error::SentinelError::from)
    }

    /// Reads newline-delimited JSON-RPC 2.0 envelopes from `reader` and
    /// writes replies to `writer`, one line each way (§4.1/§6). Envelopes
    /// whose `method` is `"tools/call"` run the full policy pipeline; every
    /// other method (handshakes, pings, `initialize`, ...) is forwarded to
    /// the downstream process unmodified, and its eventual downstream reply
    /// is relayed back uncorrelated — neither leg touches the policy engine
    /// or the audit log.
    pub async fn serve<R, W>(self: &Arc<Self>, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: AsyncWriteExt + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    self.serve_one_line(&line, &mut writer).await?;
                }
                passthrough = async {
                    let mut rx = self.passthrough_rx.lock().await;
                    rx.recv().await
                } => {
                    let Some(line) = passthrough else { continue };
                    writer.write_all(line.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                    writer.flush().await?;
                }
            }
        }
        Ok(())
    }

    async fn serve_one_line<W>(&self, line: &str, writer: &mut W) -> std::io::Result<()>
    where
        W: AsyncWriteExt + Unpin,
    {
        let raw: serde_json::Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "malformed upstream envelope");
                return Ok(());
            }
        };
        let envelope: InboundEnvelope = match serde_json::from_value(raw.clone()) {
            Ok(e) => e,
            Err(e) => {
                error!(error = %e, "malformed upstream envelope");
                return Ok(());
            }
        };

        if envelope.method.as_deref() != Some(METHOD_TOOLS_CALL) {
            if let Err(e) = self.write_downstream_line(&raw.to_string()).await {
                error!(error = %e, "failed to pass envelope through to downstream");
            }
            return Ok(());
        }

        let id = envelope.id.clone().unwrap_or(serde_json::Value::Null);
        let params: ToolCallParams = match envelope.params.clone().map(serde_json::from_value).transpose() {
            Ok(Some(p)) => p,
            Ok(None) | Err(_) => {
                error!("tools/call envelope missing or malformed params");
                return Ok(());
            }
        };

        let request = ToolCallRequest {
            id: id.clone(),
            tool: params.name,
            host: params.host,
            agent: params.agent,
            arguments: params.arguments,
            confirmation_token: params.confirmation_token,
        };

        let outcome = match self.handle(request).await {
            Ok(o) => o,
            Err(e) => ToolCallOutcome::DownstreamError { message: e.to_string() },
        };

        let reply = jsonrpc_reply(id, outcome);
        let serialized = serde_json::to_string(&reply).unwrap_or_else(|_| "{}".to_string());
        writer.write_all(serialized.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok(())
    }

    async fn write_downstream_line(&self, line: &str) -> std::io::Result<()> {
        let mut stdin = self.child_stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await
    }

    async fn forward(&self, request: &ToolCallRequest) -> Result<ToolCallOutcome, crate::error::StoreError> {
        let wire_id = self.next_request_id.fetch_add(1, Ordering::SeqCst).to_string();
        let frame = WireFrame {
            id: wire_id.clone(),
            tool: request.tool.clone(),
            arguments: request.arguments.to_json(),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(wire_id.clone(), PendingReply { sender: tx });

        let line = match serde_json::to_string(&frame) {
            Ok(s) => s,
            Err(e) => {
                self.pending.remove(&wire_id);
                return Ok(ToolCallOutcome::DownstreamError { message: e.to_string() });
            }
        };

        if let Err(e) = self.write_downstream_line(&line).await {
            self.pending.remove(&wire_id);
            return Ok(ToolCallOutcome::DownstreamError { message: e.to_string() });
        }

        match tokio::time::timeout(FORWARD_TIMEOUT, rx).await {
            Ok(Ok(reply)) => match reply.error {
                Some(message) => Ok(ToolCallOutcome::DownstreamError { message }),
                None => Ok(ToolCallOutcome::Forwarded {
                    response: Value::from_json(&reply.result.unwrap_or(serde_json::Value::Null)),
                }),
            },
            Ok(Err(_)) => Ok(ToolCallOutcome::DownstreamError {
                message: "downstream reply channel closed".to_string(),
            }),
            Err(_) => {
                self.pending.remove(&wire_id);
                Ok(ToolCallOutcome::DownstreamTimeout {
                    code: ERROR_CODE_REQUEST_TIMEOUT,
                    message: MESSAGE_REQUEST_TIMEOUT.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denied_call_never_touches_downstream() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.set_mode(crate::types::Mode::Lockdown).await.unwrap();

        let policy = PolicyEngine::new(store.clone());
        let ctx = PolicyContext {
            tool: "t".to_string(),
            host: "h".to_string(),
            agent: "a".to_string(),
            arguments: Value::empty_map(),
            timestamp_ms: 0,
            confirmation_token: None,
        };
        let verdict = policy.evaluate(&ctx, None, 0).await.unwrap();
        assert!(!verdict.allowed);
    }

    #[test]
    fn missing_host_and_agent_fall_back_to_defaults() {
        let request = ToolCallRequest {
            id: serde_json::Value::String("1".to_string()),
            tool: "t".to_string(),
            host: None,
            agent: None,
            arguments: Value::empty_map(),
            confirmation_token: None,
        };
        assert_eq!(request.resolved_host(), DEFAULT_HOST);
        assert_eq!(request.resolved_agent(), DEFAULT_AGENT);
    }

    #[test]
    fn host_and_agent_fall_back_to_argument_fields_before_the_fixed_default() {
        let mut args = std::collections::BTreeMap::new();
        args.insert("host".to_string(), Value::String("db-1".to_string()));
        let request = ToolCallRequest {
            id: serde_json::Value::String("1".to_string()),
            tool: "t".to_string(),
            host: None,
            agent: None,
            arguments: Value::Map(args),
            confirmation_token: None,
        };
        assert_eq!(request.resolved_host(), "db-1");
        assert_eq!(request.resolved_agent(), DEFAULT_AGENT);
    }

    #[test]
    fn non_tools_call_method_is_not_a_tool_call_params() {
        let raw: serde_json::Value = serde_json::from_str(
            r#"{"jsonrpc":"2.0","id":1,"method":"initialize","params":{}}"#,
        )
        .unwrap();
        let envelope: InboundEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.method.as_deref(), Some("initialize"));
        assert_ne!(envelope.method.as_deref(), Some(METHOD_TOOLS_CALL));
    }

    #[test]
    fn tools_call_params_parses_camel_case_confirmation_token() {
        let raw = serde_json::json!({
            "name": "read_file",
            "arguments": {"path": "/etc/passwd"},
            "agent": "agent-1",
            "host": "db-1",
            "confirmationToken": "tok-123",
        });
        let params: ToolCallParams = serde_json::from_value(raw).unwrap();
        assert_eq!(params.name, "read_file");
        assert_eq!(params.confirmation_token.as_deref(), Some("tok-123"));
        assert_eq!(params.host.as_deref(), Some("db-1"));
    }

    #[test]
    fn tools_call_params_defaults_arguments_to_empty_map() {
        let raw = serde_json::json!({"name": "ping"});
        let params: ToolCallParams = serde_json::from_value(raw).unwrap();
        assert_eq!(params.arguments, Value::empty_map());
    }

    #[test]
    fn denied_reply_carries_risk_score_and_factors_in_error_data() {
        let outcome = ToolCallOutcome::Denied {
            code: ERROR_CODE_POLICY_VIOLATION,
            message: MESSAGE_POLICY_VIOLATION.to_string(),
            reason: "quarantined".to_string(),
            risk_score: 42.0,
            risk_factors: vec![crate::types::RiskFactor {
                factor: "frequency".to_string(),
                score: 42.0,
                details: "nominal".to_string(),
            }],
            retry_after_seconds: None,
        };
        let reply = jsonrpc_reply(serde_json::Value::from(1), outcome);
        assert_eq!(reply["error"]["code"], ERROR_CODE_POLICY_VIOLATION);
        assert_eq!(reply["error"]["message"], MESSAGE_POLICY_VIOLATION);
        assert_eq!(reply["error"]["data"]["reason"], "quarantined");
        assert_eq!(reply["error"]["data"]["riskScore"], 42.0);
        assert_eq!(reply["error"]["data"]["riskFactors"][0]["factor"], "frequency");
    }

    #[test]
    fn ask_confirmation_reply_carries_token_and_risk_evidence() {
        let outcome = ToolCallOutcome::AskConfirmation {
            code: ERROR_CODE_CONFIRMATION_REQUIRED,
            message: MESSAGE_CONFIRMATION_REQUIRED.to_string(),
            token: "tok-456".to_string(),
            reason: "risky tool".to_string(),
            risk_score: 60.0,
            risk_factors: vec![],
        };
        let reply = jsonrpc_reply(serde_json::Value::from(2), outcome);
        assert_eq!(reply["error"]["code"], ERROR_CODE_CONFIRMATION_REQUIRED);
        assert_eq!(reply["error"]["data"]["confirmationToken"], "tok-456");
        assert_eq!(reply["error"]["data"]["riskScore"], 60.0);
    }

    #[test]
    fn timeout_reply_has_no_data_field() {
        let outcome = ToolCallOutcome::DownstreamTimeout {
            code: ERROR_CODE_REQUEST_TIMEOUT,
            message: MESSAGE_REQUEST_TIMEOUT.to_string(),
        };
        let reply = jsonrpc_reply(serde_json::Value::from(3), outcome);
        assert_eq!(reply["error"]["code"], ERROR_CODE_REQUEST_TIMEOUT);
        assert_eq!(reply["error"]["message"], MESSAGE_REQUEST_TIMEOUT);
        assert!(reply["error"].get("data").is_none());
    }

    #[test]
    fn forwarded_reply_carries_result_not_error() {
        let outcome = ToolCallOutcome::Forwarded {
            response: Value::String("ok".to_string()),
        };
        let reply = jsonrpc_reply(serde_json::Value::from(4), outcome);
        assert_eq!(reply["result"], "ok");
        assert!(reply.get("error").is_none());
    }
}
