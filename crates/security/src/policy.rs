//! Static policy engine: a rule table evaluated in-process.
//!
//! Production deployments talk to an external decision service through the
//! [`PolicyEngine`] trait. This implementation covers local development,
//! tests, and single-node setups: an ordered list of rules matched by tool
//! pattern, risk level and client, plus the kill switch.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use tether_core::error::PolicyError;
use tether_core::policy::{
    CheckStatus, PolicyChecks, PolicyDecision, PolicyEffect, PolicyEngine, PolicyRequest,
    PolicyResponse,
};
use tether_core::tool::{RiskLevel, permission_matches};

use crate::kill_switch::KillSwitch;

/// What a matching rule does.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    Allow,
    #[default]
    Deny,
    /// Needs a human approval this engine cannot grant; denied.
    RequireApproval,
}

/// One row in the rule table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub name: String,

    /// Tool id pattern: exact, `prefix:*`, or `*`.
    #[serde(default = "default_pattern")]
    pub tool: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk_level: Option<RiskLevel>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default)]
    pub action: RuleAction,

    #[serde(default)]
    pub reason: String,

    /// Higher is evaluated first; ties keep insertion order.
    #[serde(default)]
    pub priority: i32,
}

fn default_pattern() -> String {
    "*".into()
}

impl PolicyRule {
    pub fn new(name: impl Into<String>, tool: impl Into<String>, action: RuleAction) -> Self {
        Self {
            name: name.into(),
            tool: tool.into(),
            risk_level: None,
            client_id: None,
            action,
            reason: String::new(),
            priority: 0,
        }
    }

    pub fn for_risk_level(mut self, level: RiskLevel) -> Self {
        self.risk_level = Some(level);
        self
    }

    pub fn for_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn because(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    fn matches(&self, request: &PolicyRequest) -> bool {
        if !permission_matches(&self.tool, &request.resource) {
            return false;
        }
        if let Some(client) = &self.client_id {
            if client != &request.client_id {
                return false;
            }
        }
        if let Some(level) = self.risk_level {
            let requested = request
                .attributes
                .get("riskLevel")
                .and_then(|v| serde_json::from_value::<RiskLevel>(v.clone()).ok());
            if requested != Some(level) {
                return false;
            }
        }
        true
    }

    fn reason_or_default(&self) -> String {
        if self.reason.is_empty() {
            format!("Rule '{}' matched", self.name)
        } else {
            self.reason.clone()
        }
    }
}

/// A rule table, loadable from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRuleSet {
    #[serde(default)]
    pub rules: Vec<PolicyRule>,

    /// Effect when no rule matches.
    #[serde(default = "default_effect")]
    pub default_effect: PolicyEffect,
}

fn default_effect() -> PolicyEffect {
    PolicyEffect::Deny
}

impl Default for PolicyRuleSet {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_effect: default_effect(),
        }
    }
}

impl PolicyRuleSet {
    pub fn from_toml(s: &str) -> Result<Self, PolicyError> {
        toml::from_str(s).map_err(|e| PolicyError::Malformed(e.to_string()))
    }
}

pub struct StaticPolicyEngine {
    rules: RwLock<Vec<PolicyRule>>,
    default_effect: PolicyEffect,
    kill_switch: Option<Arc<KillSwitch>>,
}

impl StaticPolicyEngine {
    pub fn new(set: PolicyRuleSet) -> Self {
        let mut rules = set.rules;
        // Stable sort keeps insertion order within a priority.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Self {
            rules: RwLock::new(rules),
            default_effect: set.default_effect,
            kill_switch: None,
        }
    }

    /// Engine that allows everything not blocked by the kill switch.
    pub fn allow_all() -> Self {
        Self::new(PolicyRuleSet {
            rules: vec![],
            default_effect: PolicyEffect::Allow,
        })
    }

    /// Engine that denies everything.
    pub fn deny_all() -> Self {
        Self::new(PolicyRuleSet::default())
    }

    pub fn with_kill_switch(mut self, kill_switch: Arc<KillSwitch>) -> Self {
        self.kill_switch = Some(kill_switch);
        self
    }

    pub fn add_rule(&self, rule: PolicyRule) {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let at = rules
            .iter()
            .position(|r| r.priority < rule.priority)
            .unwrap_or(rules.len());
        rules.insert(at, rule);
    }

    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = self.rules.write().unwrap_or_else(PoisonError::into_inner);
        let before = rules.len();
        rules.retain(|r| r.name != name);
        rules.len() < before
    }

    pub fn rule_count(&self) -> usize {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn decide(&self, request: &PolicyRequest) -> (PolicyEffect, String, Option<String>, PolicyChecks) {
        let mut checks = PolicyChecks {
            kill_switch: CheckStatus::Passed,
            rate_limit: CheckStatus::Skipped,
            rules: CheckStatus::Passed,
            approval: CheckStatus::NotRequired,
        };

        if let Some(ks) = &self.kill_switch {
            if ks.is_engaged() {
                checks.kill_switch = CheckStatus::Denied;
                checks.rules = CheckStatus::Skipped;
                let reason = ks.reason().unwrap_or_else(|| "emergency stop".into());
                return (
                    PolicyEffect::Deny,
                    format!("Kill switch engaged: {reason}"),
                    Some("kill_switch".into()),
                    checks,
                );
            }
        }

        let rules = self.rules.read().unwrap_or_else(PoisonError::into_inner);
        let Some(rule) = rules.iter().find(|r| r.matches(request)) else {
            return match self.default_effect {
                PolicyEffect::Allow => (PolicyEffect::Allow, "No rule matched".into(), None, checks),
                PolicyEffect::Deny => {
                    checks.rules = CheckStatus::Denied;
                    (
                        PolicyEffect::Deny,
                        "No rule matched".into(),
                        Some("default".into()),
                        checks,
                    )
                }
            };
        };

        match rule.action {
            RuleAction::Allow => {
                debug!(rule = %rule.name, resource = %request.resource, "Policy rule allowed");
                (PolicyEffect::Allow, rule.reason_or_default(), None, checks)
            }
            RuleAction::Deny => {
                warn!(rule = %rule.name, resource = %request.resource, "Policy rule denied");
                checks.rules = CheckStatus::Denied;
                (
                    PolicyEffect::Deny,
                    rule.reason_or_default(),
                    Some(format!("rule:{}", rule.name)),
                    checks,
                )
            }
            RuleAction::RequireApproval => {
                info!(rule = %rule.name, resource = %request.resource, "Policy rule requires approval");
                checks.approval = CheckStatus::Denied;
                (
                    PolicyEffect::Deny,
                    rule.reason_or_default(),
                    Some("approval".into()),
                    checks,
                )
            }
        }
    }
}

#[async_trait]
impl PolicyEngine for StaticPolicyEngine {
    async fn evaluate(&self, request: PolicyRequest) -> Result<PolicyResponse, PolicyError> {
        let started = Instant::now();
        let (effect, reason, denied_by, checks) = self.decide(&request);
        Ok(PolicyResponse {
            decision: PolicyDecision {
                effect,
                reason,
                denied_by,
                checked_at: Utc::now(),
                evaluation_ms: started.elapsed().as_millis() as u64,
            },
            checks,
        })
    }
}
