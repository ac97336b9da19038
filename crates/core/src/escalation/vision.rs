use serde::{Deserialize, Serialize};

/// What the photo-identification responder concluded about an image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VisionAssessment {
    #[serde(default)]
    pub identified_product: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub needs_clarification: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisionEscalationReason {
    NotInCatalog,
    LowConfidence,
    BelowHardFloor,
    RepeatedNoMatch,
}

impl VisionEscalationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotInCatalog => "vision_not_in_catalog",
            Self::LowConfidence => "vision_low_confidence",
            Self::BelowHardFloor => "vision_below_hard_floor",
            Self::RepeatedNoMatch => "vision_repeated_no_match",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VisionDecision {
    Proceed,
    Clarify,
    Escalate(VisionEscalationReason),
}

#[derive(Clone, Debug, PartialEq)]
pub struct VisionEscalationPolicy {
    pub confidence_threshold: f64,
    pub hard_floor: f64,
    pub max_no_match: u32,
}

impl Default for VisionEscalationPolicy {
    fn default() -> Self {
        Self { confidence_threshold: 0.6, hard_floor: 0.3, max_no_match: 2 }
    }
}

impl VisionEscalationPolicy {
    /// `in_catalog` is `None` when no catalog lookup was possible.
    /// `previous_no_match` counts earlier consecutive turns without a match.
    pub fn evaluate(
        &self,
        assessment: &VisionAssessment,
        in_catalog: Option<bool>,
        previous_no_match: u32,
    ) -> VisionDecision {
        let identified = assessment
            .identified_product
            .as_deref()
            .map(str::trim)
            .is_some_and(|name| !name.is_empty());

        if identified {
            return if in_catalog == Some(false) {
                VisionDecision::Escalate(VisionEscalationReason::NotInCatalog)
            } else {
                VisionDecision::Proceed
            };
        }

        if previous_no_match.saturating_add(1) > self.max_no_match {
            return VisionDecision::Escalate(VisionEscalationReason::RepeatedNoMatch);
        }
        // The floor wins over a clarification request so we never loop on questions.
        if assessment.confidence < self.hard_floor {
            return VisionDecision::Escalate(VisionEscalationReason::BelowHardFloor);
        }
        if assessment.confidence < self.confidence_threshold && !assessment.needs_clarification {
            return VisionDecision::Escalate(VisionEscalationReason::LowConfidence);
        }

        VisionDecision::Clarify
    }
}
