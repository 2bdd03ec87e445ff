//! CRM-facing events for executed transfers
//!
//! An event is emitted only when a handoff executes. It carries the
//! decision fields plus the tag changes a CRM integration should apply:
//! the old owner's stage tag comes off, the new owner's goes on, and a
//! transfer marker records the edge that fired. Delivery itself lives
//! with the consumer; this module only produces the record.

use crate::candidate::{AgentRole, HandoffCandidate, HandoffDecision};
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single tag mutation for the CRM contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "tag", rename_all = "snake_case")]
pub enum TagAction {
    Add(String),
    Remove(String),
}

/// Stage tag owned by each role
fn role_tag(role: AgentRole) -> &'static str {
    match role {
        AgentRole::Intake => "Needs Qualifying",
        AgentRole::BuyerSpecialist => "Buyer-Lead",
        AgentRole::SellerSpecialist => "Seller-Lead",
    }
}

/// Notification record for one executed transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffEvent {
    pub conversation_id: String,
    pub source_role: AgentRole,
    pub target_role: AgentRole,
    pub confidence_used: f64,
    pub threshold_used: f64,
    pub occurred_at: DateTime<Utc>,
    pub tags: Vec<TagAction>,
    pub summary: String,
}

impl HandoffEvent {
    /// Build the event for an executed transfer. Blocked decisions
    /// produce no event.
    pub fn for_transfer(
        candidate: &HandoffCandidate,
        decision: &HandoffDecision,
    ) -> Option<Self> {
        if !decision.executed {
            return None;
        }
        let source = candidate.source_role;
        let target = candidate.target_role;
        Some(Self {
            conversation_id: decision.conversation_id.clone(),
            source_role: source,
            target_role: target,
            confidence_used: decision.confidence_used,
            threshold_used: decision.threshold_used,
            occurred_at: decision.decided_at,
            tags: vec![
                TagAction::Remove(role_tag(source).to_string()),
                TagAction::Add(role_tag(target).to_string()),
                TagAction::Add(format!(
                    "Handoff-{}-to-{}",
                    source.label(),
                    target.label()
                )),
            ],
            summary: format!(
                "Conversation transferred from {} to {}",
                source.label(),
                target.label()
            ),
        })
    }

    /// JSON body a CRM webhook consumer receives, tags in application
    /// order.
    pub fn payload(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
