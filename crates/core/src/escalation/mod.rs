//! Escalation policy: when to hand a conversation to a human.
//!
//! The async dispatch track lives in the agent crate; this module holds the
//! deterministic parts (level normalization, the vision decision rule and the
//! bounded duplicate-suppression set).

pub mod dedupe;
pub mod vision;

use serde::{Deserialize, Serialize};

pub use dedupe::ActiveEscalations;
pub use vision::{
    VisionAssessment, VisionDecision, VisionEscalationPolicy, VisionEscalationReason,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationLevel {
    /// Operator is notified, the assistant keeps answering.
    Soft,
    /// Operator takes over, the assistant only sends the neutral hand-off message.
    Hard,
}

impl EscalationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Soft => "soft",
            Self::Hard => "hard",
        }
    }

    /// Maps the free-text levels generators produce onto the two canonical ones.
    /// `None` means "no escalation requested".
    pub fn normalize(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "soft" | "low" | "l1" | "minor" | "notify" | "medium" => Some(Self::Soft),
            "hard" | "high" | "l2" | "critical" | "urgent" | "human" | "immediate" => {
                Some(Self::Hard)
            }
            _ => None,
        }
    }
}

/// Escalation request attached to a generated response, as the generator wrote it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationSignal {
    pub level: String,
    #[serde(default)]
    pub reason: String,
}

impl EscalationSignal {
    pub fn new(level: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { level: level.into(), reason: reason.into() }
    }

    pub fn normalized_level(&self) -> Option<EscalationLevel> {
        EscalationLevel::normalize(&self.level)
    }
}

#[cfg(test)]
mod tests {
    use super::{EscalationLevel, EscalationSignal};

    #[test]
    fn normalizes_synonyms_to_two_levels() {
        for raw in ["soft", "LOW", " l1 ", "notify"] {
            assert_eq!(EscalationLevel::normalize(raw), Some(EscalationLevel::Soft), "{raw}");
        }
        for raw in ["hard", "Critical", "URGENT", "human", "L2"] {
            assert_eq!(EscalationLevel::normalize(raw), Some(EscalationLevel::Hard), "{raw}");
        }
        for raw in ["", "none", "no", "maybe"] {
            assert_eq!(EscalationLevel::normalize(raw), None, "{raw}");
        }
    }

    #[test]
    fn signal_exposes_normalized_level() {
        let signal = EscalationSignal::new("High", "customer asked for a manager");
        assert_eq!(signal.normalized_level(), Some(EscalationLevel::Hard));
        assert_eq!(EscalationSignal::new("none", "").normalized_level(), None);
    }
}
