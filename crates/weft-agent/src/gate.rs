//! Confirmation gate
//!
//! Decides, from a tool's declared risk, whether a proposed action may run
//! straight away or must wait for a human decision.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::ToolRegistry;

/// Declared risk of running an action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Risk {
    #[default]
    Low,
    Medium,
    High,
    /// The tool could not say; policies decide how to treat it
    Unknown,
}

impl Risk {
    fn level(self) -> Option<u8> {
        match self {
            Risk::Low => Some(0),
            Risk::Medium => Some(1),
            Risk::High => Some(2),
            Risk::Unknown => None,
        }
    }
}

impl fmt::Display for Risk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Risk::Low => "low",
            Risk::Medium => "medium",
            Risk::High => "high",
            Risk::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Which actions require confirmation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ConfirmationPolicy {
    NeverConfirm,
    AlwaysConfirm,
    /// Confirm actions at or above `threshold`
    ConfirmRisky {
        #[serde(default = "default_threshold")]
        threshold: Risk,
        #[serde(default = "default_confirm_unknown")]
        confirm_unknown: bool,
    },
}

fn default_threshold() -> Risk {
    Risk::High
}

fn default_confirm_unknown() -> bool {
    true
}

impl Default for ConfirmationPolicy {
    fn default() -> Self {
        ConfirmationPolicy::ConfirmRisky {
            threshold: default_threshold(),
            confirm_unknown: default_confirm_unknown(),
        }
    }
}

impl ConfirmationPolicy {
    /// Classify a risk level under this policy
    pub fn verdict(&self, risk: Risk) -> Verdict {
        let confirm = match self {
            ConfirmationPolicy::NeverConfirm => false,
            ConfirmationPolicy::AlwaysConfirm => true,
            ConfirmationPolicy::ConfirmRisky {
                threshold,
                confirm_unknown,
            } => match (risk.level(), threshold.level()) {
                (None, _) => *confirm_unknown,
                (Some(level), Some(min)) => level >= min,
                // An unknown threshold only catches unknown risks
                (Some(_), None) => false,
            },
        };
        if confirm {
            Verdict::NeedsConfirmation
        } else {
            Verdict::Auto
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Auto,
    NeedsConfirmation,
}

/// Policy plus the optional wait limit for a decision
#[derive(Debug, Clone, Default)]
pub struct ConfirmationGate {
    policy: ConfirmationPolicy,
    timeout: Option<Duration>,
}

impl ConfirmationGate {
    pub fn new(policy: ConfirmationPolicy) -> Self {
        Self {
            policy,
            timeout: None,
        }
    }

    /// Auto-reject actions left unanswered for `timeout`
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn policy(&self) -> &ConfirmationPolicy {
        &self.policy
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Classify a proposed call using the tool's declared risk.
    ///
    /// Unknown tools are classified as [`Risk::Unknown`]; dispatch will reject
    /// them anyway, but a policy may still want a human to see them first.
    pub fn classify(&self, registry: &ToolRegistry, tool: &str, arguments: &Value) -> (Risk, Verdict) {
        let risk = registry.classify(tool, arguments).unwrap_or(Risk::Unknown);
        (risk, self.policy.verdict(risk))
    }
}
