use tracing::warn;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::flows::states::{DialogPhase, FlowState, GuardResolution};

/// Reconciles the state a responder declares with the state its dialog phase implies.
///
/// The phase-derived state wins over the declared one when the phase maps to a known
/// state; otherwise the declared state is the candidate. Either way the candidate is
/// accepted only if the transition table allows it, and a rejected turn keeps the
/// current state.
#[derive(Clone, Debug, Default)]
pub struct FlowGuard;

impl FlowGuard {
    pub fn new() -> Self {
        Self
    }

    pub fn resolve(
        &self,
        current: FlowState,
        declared: FlowState,
        phase: &DialogPhase,
    ) -> GuardResolution {
        if let Some(expected) = phase.expected_state() {
            if !current.can_transition_to(expected) {
                warn!(
                    event_name = "flow.guard.rejected",
                    from = %current,
                    declared = %declared,
                    expected = %expected,
                    dialog_phase = phase.as_str(),
                    "phase-derived transition is not allowed, keeping current state"
                );
                return GuardResolution {
                    from: current,
                    declared,
                    state: current,
                    overridden: false,
                    rejected: true,
                };
            }
            let overridden = expected != declared;
            if overridden {
                warn!(
                    event_name = "flow.guard.override",
                    from = %current,
                    declared = %declared,
                    expected = %expected,
                    dialog_phase = phase.as_str(),
                    "declared state disagrees with dialog phase, using phase-derived state"
                );
            }
            return GuardResolution {
                from: current,
                declared,
                state: expected,
                overridden,
                rejected: false,
            };
        }

        if current.can_transition_to(declared) {
            return GuardResolution {
                from: current,
                declared,
                state: declared,
                overridden: false,
                rejected: false,
            };
        }

        warn!(
            event_name = "flow.guard.rejected",
            from = %current,
            declared = %declared,
            dialog_phase = phase.as_str(),
            "declared transition is not allowed, keeping current state"
        );
        GuardResolution { from: current, declared, state: current, overridden: false, rejected: true }
    }

    pub fn resolve_with_audit<S>(
        &self,
        current: FlowState,
        declared: FlowState,
        phase: &DialogPhase,
        sink: &S,
        audit: &AuditContext,
    ) -> GuardResolution
    where
        S: AuditSink + ?Sized,
    {
        let resolution = self.resolve(current, declared, phase);
        let (event_type, outcome) = if resolution.rejected {
            ("flow.transition_rejected", AuditOutcome::Rejected)
        } else if resolution.overridden {
            ("flow.transition_overridden", AuditOutcome::Rejected)
        } else {
            ("flow.transition_applied", AuditOutcome::Success)
        };

        sink.emit(
            AuditEvent::new(audit, event_type, AuditCategory::Flow, outcome)
                .with_metadata("from", resolution.from.as_str())
                .with_metadata("declared", resolution.declared.as_str())
                .with_metadata("to", resolution.state.as_str())
                .with_metadata("dialog_phase", phase.as_str()),
        );
        resolution
    }
}
