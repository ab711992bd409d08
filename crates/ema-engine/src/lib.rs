//! # EMA Engine
//!
//! Scheduling and notification state machine for SMS-based ecological
//! momentary assessment prompts: compute each participant's prompt
//! schedule from a start event and a recurrence config, then advance every
//! pending prompt through its delivery state machine as deadlines pass.
//!
//! ## Architecture
//! ```text
//! record save ──► EligibilityGate ──► ScheduleCalculator
//!                                        └── PromptInstances (Scheduled)
//!
//! periodic tick ──► ScanEngine
//!                     ├── state machine (machine::next_decision)
//!                     ├── SmsTransport (initial / reminder-1 / reminder-2)
//!                     └── persisted status updates
//!
//! survey render ──► close-window guard (AccessAfterClose)
//! survey submit ──► Completed
//! ```
//!
//! Failure isolation is per unit of work: a bad window config, a failed
//! record load, or a failed send never halts the rest of a sweep.

pub mod admin;
pub mod calculator;
pub mod eligibility;
pub mod engine;
pub mod machine;
pub mod persistence;
pub mod rules;
pub mod scan;
pub mod survey;
pub mod testing;

pub use admin::WindowSummary;
pub use engine::{EmaEngine, run_tick_loop};
pub use machine::{MessageKind, ScanDecision, next_decision};
pub use persistence::SqliteStore;
pub use rules::SimpleRuleEvaluator;
pub use scan::{ScanEngine, ScanOutcome};
pub use survey::{RenderOutcome, SurveyHooks};
