//! Policy engine contract. The runtime only sees requests and decisions.
//!
//! Rule evaluation lives in an external service. Anything other than an
//! explicit `allow` is a hard denial.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PolicyError;

/// Action string used for every tool invocation check.
pub const TOOL_INVOKE_ACTION: &str = "tool:invoke";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    Agent,
    User,
    System,
}

/// A question put to the policy engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRequest {
    pub action: String,
    pub resource: String,
    pub client_id: String,
    pub actor_type: ActorType,
    pub actor_id: String,
    pub attributes: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyEffect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub effect: PolicyEffect,
    pub reason: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denied_by: Option<String>,

    pub checked_at: DateTime<Utc>,
    pub evaluation_ms: u64,
}

impl PolicyDecision {
    pub fn is_allow(&self) -> bool {
        self.effect == PolicyEffect::Allow
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Passed,
    Skipped,
    Denied,
    NotRequired,
}

/// Per-stage breakdown of how the decision was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyChecks {
    pub kill_switch: CheckStatus,
    pub rate_limit: CheckStatus,
    pub rules: CheckStatus,
    pub approval: CheckStatus,
}

impl PolicyChecks {
    pub fn all_passed() -> Self {
        Self {
            kill_switch: CheckStatus::Passed,
            rate_limit: CheckStatus::Passed,
            rules: CheckStatus::Passed,
            approval: CheckStatus::NotRequired,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyResponse {
    pub decision: PolicyDecision,
    pub checks: PolicyChecks,
}

impl PolicyResponse {
    pub fn allow(reason: impl Into<String>) -> Self {
        Self {
            decision: PolicyDecision {
                effect: PolicyEffect::Allow,
                reason: reason.into(),
                denied_by: None,
                checked_at: Utc::now(),
                evaluation_ms: 0,
            },
            checks: PolicyChecks::all_passed(),
        }
    }

    pub fn deny(reason: impl Into<String>, denied_by: impl Into<String>) -> Self {
        Self {
            decision: PolicyDecision {
                effect: PolicyEffect::Deny,
                reason: reason.into(),
                denied_by: Some(denied_by.into()),
                checked_at: Utc::now(),
                evaluation_ms: 0,
            },
            checks: PolicyChecks {
                rules: CheckStatus::Denied,
                ..PolicyChecks::all_passed()
            },
        }
    }
}

/// The external decision service.
///
/// Implementations must be safe to call concurrently from many episodes;
/// the runtime does not serialize access.
#[async_trait]
pub trait PolicyEngine: Send + Sync {
    async fn evaluate(&self, request: PolicyRequest) -> Result<PolicyResponse, PolicyError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_wire_shape() {
        let resp = PolicyResponse::deny("Not authorized", "rules");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["decision"]["effect"], "deny");
        assert_eq!(json["decision"]["deniedBy"], "rules");
        assert_eq!(json["checks"]["killSwitch"], "passed");
        assert_eq!(json["checks"]["rules"], "denied");
        assert_eq!(json["checks"]["approval"], "not_required");
    }

    #[test]
    fn allow_is_allow() {
        assert!(PolicyResponse::allow("ok").decision.is_allow());
        assert!(!PolicyResponse::deny("no", "rules").decision.is_allow());
    }

    #[test]
    fn request_uses_camel_case() {
        let req = PolicyRequest {
            action: TOOL_INVOKE_ACTION.into(),
            resource: "memory:read".into(),
            client_id: "c1".into(),
            actor_type: ActorType::Agent,
            actor_id: "a1".into(),
            attributes: serde_json::json!({}),
            request_id: None,
            episode_id: Some("ep".into()),
        };
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["clientId"], "c1");
        assert_eq!(json["actorType"], "agent");
        assert_eq!(json["episodeId"], "ep");
        assert!(json.get("requestId").is_none());
    }
}
