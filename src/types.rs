//! Shared value types for the sentinel core.
//!
//! These are the sum types that cross every subsystem boundary: the dynamic
//! argument tree, the policy context extracted from an inbound request, and
//! the enums (`Mode`, `Action`, `Verdict`) that are persisted as strings but
//! must never silently decode to something permissive.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A recursive, untyped JSON-like value used for tool call arguments.
///
/// Modeling `arguments` as this explicit tagged tree (rather than passing
/// `serde_json::Value` around everywhere) keeps redaction and canonical
/// serialization as pure functions with one obvious entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn from_json(v: &serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.clone()),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(a) => Value::List(a.iter().map(Value::from_json).collect()),
            serde_json::Value::Object(o) => Value::Map(
                o.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(l) => serde_json::Value::Array(l.iter().map(Value::to_json).collect()),
            Value::Map(m) => serde_json::Value::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    pub fn empty_map() -> Self {
        Value::Map(BTreeMap::new())
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
}

/// The 5-tuple describing one inbound tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyContext {
    pub tool: String,
    pub host: String,
    pub agent: String,
    pub arguments: Value,
    pub timestamp_ms: i64,
    /// Confirmation token presented on a retry, if any.
    pub confirmation_token: Option<String>,
}

impl PolicyContext {
    pub fn now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

/// Process-global policy posture. Persisted as a string; any value outside
/// these four is a hard error at read time, never a silent fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    SilentAllow,
    Alert,
    SilentDeny,
    Lockdown,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::SilentAllow => "silent-allow",
            Mode::Alert => "alert",
            Mode::SilentDeny => "silent-deny",
            Mode::Lockdown => "lockdown",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ModeParseError> {
        match s {
            "silent-allow" => Ok(Mode::SilentAllow),
            "alert" => Ok(Mode::Alert),
            "silent-deny" => Ok(Mode::SilentDeny),
            "lockdown" => Ok(Mode::Lockdown),
            other => Err(ModeParseError(other.to_string())),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown mode string: {0:?} (must be one of silent-allow, alert, silent-deny, lockdown)")]
pub struct ModeParseError(pub String);

/// The action a matched rule (or default policy) prescribes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Allow,
    Deny,
    Ask,
    LogOnly,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Deny => "deny",
            Action::Ask => "ask",
            Action::LogOnly => "log-only",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ActionParseError> {
        match s {
            "allow" => Ok(Action::Allow),
            "deny" => Ok(Action::Deny),
            "ask" => Ok(Action::Ask),
            "log-only" => Ok(Action::LogOnly),
            other => Err(ActionParseError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown action string: {0:?}")]
pub struct ActionParseError(pub String);

/// The recorded outcome of a decision, distinct from `Action` because a
/// `log-only` action still yields an `allowed` verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Allowed,
    Denied,
    Asked,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Allowed => "allowed",
            Verdict::Denied => "denied",
            Verdict::Asked => "asked",
        }
    }

    pub fn parse(s: &str) -> Result<Self, VerdictParseError> {
        match s {
            "allowed" => Ok(Verdict::Allowed),
            "denied" => Ok(Verdict::Denied),
            "asked" => Ok(Verdict::Asked),
            other => Err(VerdictParseError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown verdict string: {0:?}")]
pub struct VerdictParseError(pub String);

/// Terminal status of the downstream response, filled in after the fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Success,
    Error,
    Timeout,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Success => "success",
            ResponseStatus::Error => "error",
            ResponseStatus::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Result<Self, ResponseStatusParseError> {
        match s {
            "success" => Ok(ResponseStatus::Success),
            "error" => Ok(ResponseStatus::Error),
            "timeout" => Ok(ResponseStatus::Timeout),
            other => Err(ResponseStatusParseError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown response status string: {0:?}")]
pub struct ResponseStatusParseError(pub String);

/// Scope of a quarantine entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuarantineScope {
    Host,
    Tool,
    Agent,
}

impl QuarantineScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuarantineScope::Host => "host",
            QuarantineScope::Tool => "tool",
            QuarantineScope::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Result<Self, QuarantineScopeParseError> {
        match s {
            "host" => Ok(QuarantineScope::Host),
            "tool" => Ok(QuarantineScope::Tool),
            "agent" => Ok(QuarantineScope::Agent),
            other => Err(QuarantineScopeParseError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown quarantine scope string: {0:?}")]
pub struct QuarantineScopeParseError(pub String);

/// State of a per-host circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }

    pub fn parse(s: &str) -> Result<Self, CircuitStateParseError> {
        match s {
            "closed" => Ok(CircuitState::Closed),
            "open" => Ok(CircuitState::Open),
            "half-open" => Ok(CircuitState::HalfOpen),
            other => Err(CircuitStateParseError(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown circuit state string: {0:?}")]
pub struct CircuitStateParseError(pub String);

/// One contributing factor to a risk score, surfaced to operators.
/// `score` is on the same 0..100 scale as [`PolicyVerdict::risk_score`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFactor {
    pub factor: String,
    pub score: f64,
    pub details: String,
}

/// The engine's decision record for one policy context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyVerdict {
    pub allowed: bool,
    pub action: Action,
    pub reason: String,
    pub matched_rule_id: Option<String>,
    /// 0..100. Anomaly scoring only ever annotates this value; it never by
    /// itself changes `action` or `allowed`.
    pub risk_score: f64,
    pub risk_factors: Vec<RiskFactor>,
    pub requires_confirmation: bool,
    pub confirmation_token: Option<String>,
    pub retry_after_seconds: Option<u64>,
}

impl PolicyVerdict {
    pub fn verdict(&self) -> Verdict {
        if self.requires_confirmation {
            Verdict::Asked
        } else if self.allowed {
            Verdict::Allowed
        } else {
            Verdict::Denied
        }
    }
}
