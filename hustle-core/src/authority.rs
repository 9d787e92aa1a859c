//! Authority gate for AI-proposed actions
//!
//! Deterministic classifier from (action, subsystem) to a capability
//! level. Money movement, reward awards, trust changes, bans, and
//! dispute finalization are hard-wired to A0 regardless of any input;
//! everything unknown fails closed. The gate runs before side effects
//! at every AI-adjacent call site.

use serde::Serialize;
use tracing::warn;

use crate::error::CoreError;
use crate::CoreResult;

/// Capability level bounding what an AI component may do
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum AuthorityLevel {
    /// AI may not participate; any AI output is discarded
    A0Forbidden,
    /// AI may summarize or classify for display; no state mutation
    A1ReadOnly,
    /// AI output is a proposal; a deterministic validator decides
    A2Proposal,
    /// AI may trigger a bounded, reversible action with explicit user
    /// consent, rate limits, and audit
    A3Restricted,
}

impl AuthorityLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A0Forbidden => "A0",
            Self::A1ReadOnly => "A1",
            Self::A2Proposal => "A2",
            Self::A3Restricted => "A3",
        }
    }
}

impl std::fmt::Display for AuthorityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of classifying an (action, subsystem) pair
#[derive(Debug, Clone, Serialize)]
pub struct AuthorityDecision {
    pub allowed: bool,
    pub required_level: AuthorityLevel,
    pub reason: Option<String>,
}

/// Subsystems that are A0 no matter what the caller claims
const HARD_FORBIDDEN_SUBSYSTEMS: &[&str] = &[
    "xp.award",
    "trust.tier",
    "escrow.release",
    "escrow.capture",
    "escrow.refund",
    "user.ban",
    "user.suspend",
    "dispute.finalize",
];

/// Action names that are A0 by themselves, whatever subsystem they
/// claim to run under
const HARD_FORBIDDEN_ACTIONS: &[&str] = &[
    "awardXP",
    "changeTrustTier",
    "releaseEscrow",
    "captureEscrow",
    "refundEscrow",
    "forceRefund",
    "banUser",
    "suspendUser",
    "finalizeDispute",
    "HOLD_ESCROW",
    "RELEASE_PAYOUT",
    "REFUND_ESCROW",
    "FORCE_REFUND",
    "LOCK_DISPUTE",
];

/// Known subsystem classifications beyond the hard list
const SUBSYSTEM_LEVELS: &[(&str, AuthorityLevel)] = &[
    ("task.summary", AuthorityLevel::A1ReadOnly),
    ("feed.rank", AuthorityLevel::A1ReadOnly),
    ("profile.read", AuthorityLevel::A1ReadOnly),
    ("wallet.read", AuthorityLevel::A1ReadOnly),
    ("dispute.read", AuthorityLevel::A1ReadOnly),
    ("task.categorize", AuthorityLevel::A2Proposal),
    ("task.match", AuthorityLevel::A2Proposal),
    ("proof.classify", AuthorityLevel::A2Proposal),
    ("dispute.recommend", AuthorityLevel::A2Proposal),
    ("notification.send", AuthorityLevel::A3Restricted),
    ("task.nudge", AuthorityLevel::A3Restricted),
];

/// The rule surface that bounds AI participation
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthorityGate;

impl AuthorityGate {
    pub fn new() -> Self {
        Self
    }

    /// Classify an (action, subsystem) pair. Pure; never blocks.
    pub fn validate(&self, action: &str, subsystem: &str) -> AuthorityDecision {
        let hard_forbidden = HARD_FORBIDDEN_SUBSYSTEMS.iter().any(|s| *s == subsystem)
            || HARD_FORBIDDEN_ACTIONS.iter().any(|a| *a == action);
        if hard_forbidden {
            return AuthorityDecision {
                allowed: false,
                required_level: AuthorityLevel::A0Forbidden,
                reason: Some(format!(
                    "'{action}' on '{subsystem}' is reserved for deterministic code"
                )),
            };
        }

        if let Some((_, level)) = SUBSYSTEM_LEVELS.iter().find(|(name, _)| *name == subsystem) {
            return AuthorityDecision {
                allowed: true,
                required_level: *level,
                reason: None,
            };
        }

        // Unknown subsystems fail closed
        AuthorityDecision {
            allowed: false,
            required_level: AuthorityLevel::A0Forbidden,
            reason: Some(format!("subsystem '{subsystem}' is not classified")),
        }
    }

    /// Reject an AI attempt at a forbidden action before any side effect
    pub fn enforce(&self, action: &str, subsystem: &str) -> CoreResult<AuthorityDecision> {
        let decision = self.validate(action, subsystem);
        if decision.allowed {
            Ok(decision)
        } else {
            warn!(
                action,
                subsystem,
                reason = decision.reason.as_deref().unwrap_or(""),
                "rejected AI action at the authority gate"
            );
            Err(CoreError::authority(action, subsystem))
        }
    }
}
