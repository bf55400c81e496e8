//! Mentor - Invisible Learning Layer
//!
//! Lets an agent-creation workflow consult the external `engram` learning CLI
//! for template and skill recommendations, while guaranteeing the caller never
//! observes whether that tool is installed, healthy, or absent.
//!
//! The caller-facing contract is uniform across every operating mode: the same
//! request always produces a well-formed result, differing only in mode-marker
//! fields that callers are free to ignore.

pub mod bridge;
pub mod config;
pub mod feedback;
pub mod invoke;
pub mod orchestrate;
pub mod parse;
pub mod probe;
pub mod records;
pub mod validate;

pub use bridge::{InvocationStrategy, ToolBridge};
pub use config::MentorConfig;
pub use feedback::UsageTracker;
pub use invoke::{FakeInvoker, InvokeError, InvokeRequest, Invocation, Invoker, ProcessInvoker};
pub use orchestrate::{next_mode, OperatingMode, Orchestrator, OrchestratorStatus};
pub use probe::AvailabilityProber;
pub use records::*;
pub use validate::{
    Complexity, ConfidenceValidator, SourceCandidate, StructureKind, StructurePlan,
    ValidationKind, ValidationResult, ValidationSummary,
};
