//! Security module for tether: audit logging, kill switch, and a static
//! policy engine.
//!
//! Provides:
//! - **Audit logging**: the in-process [`AuditEmitter`](tether_core::AuditEmitter)
//! - **Kill switch**: in-memory flag plus operator flag file
//! - **Static policy**: rule-table [`PolicyEngine`](tether_core::PolicyEngine)

pub mod audit;
pub mod kill_switch;
pub mod policy;

pub use audit::{AuditLogger, AuditSink, TracingSink};
pub use kill_switch::{DEFAULT_FLAG_POLL_INTERVAL, KillSwitch};
pub use policy::{PolicyRule, PolicyRuleSet, RuleAction, StaticPolicyEngine};
