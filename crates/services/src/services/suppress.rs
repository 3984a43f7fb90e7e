//! Declarative log hygiene for vendor noise. Known-benign vendor errors are
//! downgraded to debug so real failures stay visible; nothing here recovers
//! from anything, the lifecycle manager does that.

use serde_json::Value;
use tracing::{debug, error, warn};

use super::sdk::VendorSdkError;

/// A shape predicate over a vendor error payload.
#[derive(Debug, Clone, PartialEq)]
pub enum SuppressionRule {
    /// The vendor's global handler occasionally surfaces `{}` or `null`
    /// payloads for races it has already absorbed.
    EmptyErrorPayload,
    /// "user id already set" rejections; the manager handles these with an
    /// implicit logout, so the raw rejection is noise.
    UserAlreadySet,
    /// Any payload whose message contains this substring.
    MessageContains(String),
}

impl SuppressionRule {
    pub fn matches(&self, payload: &Value) -> bool {
        match self {
            Self::EmptyErrorPayload => match payload {
                Value::Null => true,
                Value::Object(map) => map.is_empty(),
                Value::String(s) => s.is_empty(),
                _ => false,
            },
            Self::UserAlreadySet => payload_message(payload)
                .map(|m| m.to_lowercase().contains("already set"))
                .unwrap_or(false),
            Self::MessageContains(needle) => payload_message(payload)
                .map(|m| m.contains(needle.as_str()))
                .unwrap_or(false),
        }
    }
}

fn payload_message(payload: &Value) -> Option<&str> {
    match payload {
        Value::String(s) => Some(s),
        Value::Object(map) => map.get("message").and_then(Value::as_str),
        _ => None,
    }
}

/// Structured sink for vendor-facing errors, configured with a rule list
/// instead of wrapping a global logger.
#[derive(Debug, Clone)]
pub struct VendorLogSink {
    rules: Vec<SuppressionRule>,
}

impl Default for VendorLogSink {
    fn default() -> Self {
        Self::new(vec![
            SuppressionRule::EmptyErrorPayload,
            SuppressionRule::UserAlreadySet,
        ])
    }
}

impl VendorLogSink {
    pub fn new(rules: Vec<SuppressionRule>) -> Self {
        Self { rules }
    }

    fn suppressed_by(&self, payload: &Value) -> Option<&SuppressionRule> {
        self.rules.iter().find(|r| r.matches(payload))
    }

    /// Report a raw vendor error payload.
    pub fn report(&self, context: &str, payload: &Value) {
        match self.suppressed_by(payload) {
            Some(rule) => debug!(context, ?rule, "suppressed benign vendor error"),
            None => error!(context, payload = %payload, "vendor error"),
        }
    }

    /// Report a typed SDK error. Recoverable rejections land at warn even
    /// when not suppressed; they never reach the caller.
    pub fn vendor_error(&self, context: &str, err: &VendorSdkError) {
        let payload = Value::String(err.to_string());
        match self.suppressed_by(&payload) {
            Some(rule) => debug!(context, ?rule, "suppressed benign vendor error"),
            None => warn!(context, error = %err, "vendor call failed"),
        }
    }
}
