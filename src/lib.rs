//! permit-pilot library
//!
//! Files express mechanical permits by driving a county permit portal's
//! application wizard: scripted steps where the portal is stable, a vision
//! model where it is not, a durable pause for manual fee payment, and the
//! permit number read back once the fee is paid.

pub mod batch;
pub mod browser;
pub mod cli;
pub mod core;
pub mod logging;
pub mod orchestrator;
pub mod queue;

pub use batch::{BatchItem, BatchRunner, BatchSummary};
pub use browser::{ElementRef, PortalPage, PortalSession, SessionFactory};
pub use core::{OrchestratorConfig, Outcome, PortalError, Step, SubmissionRequest, SubmissionResult};
pub use logging::{EventId, LogLevel, PortalEvent, SystemLogger};
pub use orchestrator::{StepSequencer, VisionAnalyzer};
pub use queue::{QueueStatus, SubmissionQueue};
