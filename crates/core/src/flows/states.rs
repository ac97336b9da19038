use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowState {
    Init,
    Discovery,
    Vision,
    SizeColor,
    Offer,
    PaymentDelivery,
    Upsell,
    End,
    Complaint,
    OutOfDomain,
}

impl FlowState {
    pub const ALL: [FlowState; 10] = [
        FlowState::Init,
        FlowState::Discovery,
        FlowState::Vision,
        FlowState::SizeColor,
        FlowState::Offer,
        FlowState::PaymentDelivery,
        FlowState::Upsell,
        FlowState::End,
        FlowState::Complaint,
        FlowState::OutOfDomain,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Discovery => "DISCOVERY",
            Self::Vision => "VISION",
            Self::SizeColor => "SIZE_COLOR",
            Self::Offer => "OFFER",
            Self::PaymentDelivery => "PAYMENT_DELIVERY",
            Self::Upsell => "UPSELL",
            Self::End => "END",
            Self::Complaint => "COMPLAINT",
            Self::OutOfDomain => "OUT_OF_DOMAIN",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_uppercase();
        Self::ALL.into_iter().find(|state| state.as_str() == normalized)
    }

    /// Complaint and out-of-domain are side states: reachable from anywhere and
    /// left only when the customer re-engages with the catalog.
    pub fn is_side_state(&self) -> bool {
        matches!(self, Self::Complaint | Self::OutOfDomain)
    }

    pub fn can_transition_to(&self, next: FlowState) -> bool {
        use FlowState::*;

        if *self == next || next.is_side_state() {
            return true;
        }

        matches!(
            (self, next),
            (Init, Discovery)
                | (Init, Vision)
                | (Discovery, Vision)
                | (Vision, Discovery)
                | (Vision, SizeColor)
                | (SizeColor, Vision)
                | (SizeColor, Offer)
                | (Offer, PaymentDelivery)
                | (PaymentDelivery, Upsell)
                | (Upsell, End)
                | (Complaint, Discovery)
                | (Complaint, Vision)
                | (OutOfDomain, Discovery)
                | (OutOfDomain, Vision)
        )
    }
}

impl fmt::Display for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fine-grained sub-status within a state, e.g. `WAITING_FOR_PAYMENT_PROOF`.
///
/// Phases are free-form; only the known ones pin the conversation to a state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DialogPhase(pub String);

impl DialogPhase {
    pub const INIT: &'static str = "INIT";
    pub const WAITING_FOR_PAYMENT_PROOF: &'static str = "WAITING_FOR_PAYMENT_PROOF";
    pub const AWAITING_PAYMENT_APPROVAL: &'static str = "AWAITING_PAYMENT_APPROVAL";
    pub const COMPLETED: &'static str = "COMPLETED";

    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn expected_state(&self) -> Option<FlowState> {
        let phase = self.0.trim().to_ascii_uppercase();
        let state = match phase.as_str() {
            "INIT" => FlowState::Init,
            "DISCOVERY" | "BROWSING" => FlowState::Discovery,
            "WAITING_FOR_PHOTO" | "PHOTO_IDENTIFIED" => FlowState::Vision,
            "WAITING_FOR_SIZE" | "WAITING_FOR_COLOR" => FlowState::SizeColor,
            "OFFER_MADE" | "WAITING_FOR_OFFER_CONFIRMATION" => FlowState::Offer,
            "WAITING_FOR_DELIVERY_DATA"
            | "WAITING_FOR_PAYMENT_METHOD"
            | "WAITING_FOR_PAYMENT_PROOF"
            | "AWAITING_PAYMENT_APPROVAL" => FlowState::PaymentDelivery,
            "UPSELL_OFFERED" => FlowState::Upsell,
            "COMPLETED" => FlowState::End,
            "COMPLAINT" => FlowState::Complaint,
            "OUT_OF_DOMAIN" => FlowState::OutOfDomain,
            _ => return None,
        };
        Some(state)
    }
}

impl From<&str> for DialogPhase {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardResolution {
    pub from: FlowState,
    pub declared: FlowState,
    pub state: FlowState,
    /// The declared state disagreed with the phase and was replaced.
    pub overridden: bool,
    /// The declared state was not a legal transition and was dropped.
    pub rejected: bool,
}
