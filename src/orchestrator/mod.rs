//! Portal submission orchestrator
//!
//! ```text
//! StepSequencer ── checkpoint after every step ──► CheckpointStore (SQLite)
//!      │
//!      ├─ steps 0-6  deterministic handlers, each behind RecoveryWrapper
//!      ├─ steps 7-9  adaptive handlers (heuristics, then VisionAnalyzer)
//!      ├─ AwaitingPayment  pause; run returns a pending result
//!      └─ PostPayment  record page ──► PermitNumberExtractor ──► Complete
//!
//! every handler: ActionExecutor (typed references) + StabilityGate
//! ```
//!
//! Key rules:
//! - **Checkpoint after advance**: a resumed run never replays a completed step
//! - **One recovery attempt**: vision suggestions run only above the confidence threshold
//! - **Payment is a pause**: reaching it is not a failure

pub mod action;
pub mod checkpoint;
pub mod permit;
pub mod recovery;
pub mod sequencer;
pub mod stability;
pub mod steps;
pub mod vision;

pub use action::{ActionDescriptor, ActionExecutor, DescriptorError, ElementAction};
pub use checkpoint::{CheckpointStore, SqliteCheckpointStore};
pub use permit::{classify_page, PermitNumberExtractor, SubmitClassification};
pub use recovery::RecoveryWrapper;
pub use sequencer::{check_transition, StepSequencer};
pub use stability::{GateOutcome, StabilityGate};
pub use steps::{step_table, StepContext, StepHandler, StepSpec};
pub use vision::{StaticAnalyzer, StepAnalyzer, VisionAnalysis, VisionAnalyzer};
