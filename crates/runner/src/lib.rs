//! FlowSeal Runner
//!
//! Drives a declarative flow plan against a web page and seals a
//! tamper-evident evidence packet for every run, successful or not:
//! - Validates plans in one pass and gates them on their capture mode
//! - Resolves selectors under a stabilization policy that refuses ambiguity
//! - Captures evidence for every step through a page driver
//! - Seals the deliverable with a canonical manifest and packet hash
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       FlowRunner                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  FlowPlan::from_yaml ──► capture_mode::enforce              │
//! │         │                                                   │
//! │         ▼                                                   │
//! │  DriverLauncher::launch ──► StepEngine::run                 │
//! │    ├── StabilizationPolicy::resolve (strict | relaxed)      │
//! │    ├── Redactor::redact (step notes)                        │
//! │    └── EvidenceCollector::capture ──► IntegrityStrategy     │
//! │         │                                                   │
//! │         ▼  (always, from every exit path)                   │
//! │  teardown ──► metadata, logs, report ──► Sealer::seal       │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod capture_mode;
pub mod config;
pub mod context;
pub mod driver;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod plan;
pub mod playwright;
pub mod redaction;
pub mod report;
pub mod runner;
pub mod selector;
pub mod verify;

pub use config::RunnerConfig;
pub use context::{Clock, FixedClock, RunContext, RunStatus, StepRef, SystemClock};
pub use driver::{Action, DriverLauncher, PageDriver, RecordingKind, SnapshotKind};
pub use error::{DriverError, ErrorKind, FlowError, RunnerError, RunnerResult};
pub use plan::{CaptureMode, FlowPlan, Step, StepKind};
pub use playwright::{PlaywrightConfig, PlaywrightLauncher};
pub use runner::{FlowRunner, RunOutcome};
pub use verify::{verify_deliverable, DeliverableVerification};

/// Runner version, recorded in run metadata
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
