//! Core domain types for handoff evaluation
//!
//! A [`HandoffCandidate`] is the inbound request: some agent believes the
//! conversation should move to another agent, with a confidence score
//! attached. The evaluator answers with a [`HandoffDecision`], and every
//! evaluation leaves behind exactly one [`HandoffAttempt`] in the audit
//! trail, executed or not.

use crate::error::{HandoffError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Conversational roles that can own a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    /// First-touch qualification agent
    Intake,
    /// Buyer-side specialist
    BuyerSpecialist,
    /// Seller-side specialist
    SellerSpecialist,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Intake => "intake",
            AgentRole::BuyerSpecialist => "buyer_specialist",
            AgentRole::SellerSpecialist => "seller_specialist",
        }
    }

    /// Short human-readable label used in notification text and tags
    pub fn label(&self) -> &'static str {
        match self {
            AgentRole::Intake => "Intake",
            AgentRole::BuyerSpecialist => "Buyer",
            AgentRole::SellerSpecialist => "Seller",
        }
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRole {
    type Err = HandoffError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "intake" => Ok(AgentRole::Intake),
            "buyer_specialist" => Ok(AgentRole::BuyerSpecialist),
            "seller_specialist" => Ok(AgentRole::SellerSpecialist),
            other => Err(HandoffError::InvalidCandidate {
                message: format!("unknown agent role: {other}"),
            }),
        }
    }
}

/// An ordered (source, target) role pair.
///
/// Thresholds, circular checks, and adaptation state are all keyed by
/// direction: intake -> buyer is a different edge than buyer -> intake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Direction {
    pub source: AgentRole,
    pub target: AgentRole,
}

impl Direction {
    pub fn new(source: AgentRole, target: AgentRole) -> Self {
        Self { source, target }
    }

    /// The opposite edge, used when looking for circular patterns.
    pub fn reversed(&self) -> Self {
        Self {
            source: self.target,
            target: self.source,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.source, self.target)
    }
}

impl FromStr for Direction {
    type Err = HandoffError;

    fn from_str(s: &str) -> Result<Self> {
        let (source, target) = s.split_once("->").ok_or_else(|| HandoffError::InvalidCandidate {
            message: format!("direction must look like 'source->target', got: {s}"),
        })?;
        Ok(Direction {
            source: source.trim().parse()?,
            target: target.trim().parse()?,
        })
    }
}

/// Why a handoff was blocked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    /// Confidence fell short of the effective threshold
    BelowThreshold,
    /// Same-direction handoff already executed inside the circular window
    CircularWindow,
    /// Hourly or daily handoff budget exhausted
    RateLimited,
    /// Conversation lock could not be acquired within the attempt budget
    LockUnavailable,
    /// Recorded owner no longer matches the candidate's source role
    StaleOwnership,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::BelowThreshold => "below_threshold",
            BlockReason::CircularWindow => "circular_window",
            BlockReason::RateLimited => "rate_limited",
            BlockReason::LockUnavailable => "lock_unavailable",
            BlockReason::StaleOwnership => "stale_ownership",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BlockReason {
    type Err = HandoffError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "below_threshold" => Ok(BlockReason::BelowThreshold),
            "circular_window" => Ok(BlockReason::CircularWindow),
            "rate_limited" => Ok(BlockReason::RateLimited),
            "lock_unavailable" => Ok(BlockReason::LockUnavailable),
            "stale_ownership" => Ok(BlockReason::StaleOwnership),
            other => Err(HandoffError::Backend(format!(
                "unknown block reason: {other}"
            ))),
        }
    }
}

/// A proposed ownership transfer awaiting evaluation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffCandidate {
    pub conversation_id: String,
    pub source_role: AgentRole,
    pub target_role: AgentRole,
    #[serde(rename = "confidence_score")]
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
}

impl HandoffCandidate {
    pub fn new(
        conversation_id: impl Into<String>,
        source_role: AgentRole,
        target_role: AgentRole,
        confidence: f64,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            source_role,
            target_role,
            confidence,
            timestamp: Utc::now(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn direction(&self) -> Direction {
        Direction::new(self.source_role, self.target_role)
    }

    /// Structural validation, run before any evaluation step.
    ///
    /// Rejects self-handoffs, empty conversation ids, and confidence values
    /// outside `[0.0, 1.0]` (NaN included).
    pub fn validate(&self) -> Result<()> {
        if self.conversation_id.trim().is_empty() {
            return Err(HandoffError::InvalidCandidate {
                message: "conversation_id is empty".to_string(),
            });
        }
        if self.source_role == self.target_role {
            return Err(HandoffError::InvalidCandidate {
                message: format!(
                    "source and target roles are both {}",
                    self.source_role
                ),
            });
        }
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(HandoffError::InvalidCandidate {
                message: format!("confidence {} is outside [0.0, 1.0]", self.confidence),
            });
        }
        Ok(())
    }
}

/// Two-valued verdict stored with every attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptDecision {
    Executed,
    Blocked,
}

impl AttemptDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptDecision::Executed => "executed",
            AttemptDecision::Blocked => "blocked",
        }
    }
}

/// One audited evaluation, executed or blocked.
///
/// `block_reason` is `Some` exactly when the decision is blocked; the
/// constructors below keep that pairing intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffAttempt {
    pub id: Uuid,
    pub conversation_id: String,
    pub source_role: AgentRole,
    pub target_role: AgentRole,
    #[serde(rename = "confidence_score")]
    pub confidence: f64,
    pub threshold_used: f64,
    pub decision: AttemptDecision,
    pub block_reason: Option<BlockReason>,
    pub created_at: DateTime<Utc>,
}

impl HandoffAttempt {
    pub fn executed(candidate: &HandoffCandidate, threshold_used: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: candidate.conversation_id.clone(),
            source_role: candidate.source_role,
            target_role: candidate.target_role,
            confidence: candidate.confidence,
            threshold_used,
            decision: AttemptDecision::Executed,
            block_reason: None,
            created_at: Utc::now(),
        }
    }

    pub fn blocked(candidate: &HandoffCandidate, threshold_used: f64, reason: BlockReason) -> Self {
        Self {
            id: Uuid::new_v4(),
            conversation_id: candidate.conversation_id.clone(),
            source_role: candidate.source_role,
            target_role: candidate.target_role,
            confidence: candidate.confidence,
            threshold_used,
            decision: AttemptDecision::Blocked,
            block_reason: Some(reason),
            created_at: Utc::now(),
        }
    }

    pub fn is_executed(&self) -> bool {
        self.decision == AttemptDecision::Executed
    }

    pub fn direction(&self) -> Direction {
        Direction::new(self.source_role, self.target_role)
    }
}

/// The evaluator's answer for one candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffDecision {
    pub conversation_id: String,
    pub executed: bool,
    /// Owner after this evaluation; set only when executed
    pub new_owner: Option<AgentRole>,
    pub block_reason: Option<BlockReason>,
    pub confidence_used: f64,
    pub threshold_used: f64,
    pub decided_at: DateTime<Utc>,
}

impl HandoffDecision {
    pub fn executed(candidate: &HandoffCandidate, threshold_used: f64) -> Self {
        Self {
            conversation_id: candidate.conversation_id.clone(),
            executed: true,
            new_owner: Some(candidate.target_role),
            block_reason: None,
            confidence_used: candidate.confidence,
            threshold_used,
            decided_at: Utc::now(),
        }
    }

    pub fn blocked(candidate: &HandoffCandidate, threshold_used: f64, reason: BlockReason) -> Self {
        Self {
            conversation_id: candidate.conversation_id.clone(),
            executed: false,
            new_owner: None,
            block_reason: Some(reason),
            confidence_used: candidate.confidence,
            threshold_used,
            decided_at: Utc::now(),
        }
    }

    /// Stable string form of the outcome, `"executed"` or a block reason.
    pub fn reason(&self) -> &'static str {
        match self.block_reason {
            Some(reason) => reason.as_str(),
            None => "executed",
        }
    }
}

/// A settled result for an executed handoff, fed back into threshold
/// adaptation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HandoffOutcome {
    pub direction: Direction,
    pub success: bool,
    pub occurred_at: DateTime<Utc>,
}

impl HandoffOutcome {
    pub fn new(direction: Direction, success: bool) -> Self {
        Self {
            direction,
            success,
            occurred_at: Utc::now(),
        }
    }
}
