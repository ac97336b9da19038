pub mod engine;
pub mod states;

pub use engine::FlowGuard;
pub use states::{DialogPhase, FlowState, GuardResolution};
