//! # EMA Core
//!
//! Shared data model and collaborator seams for the EMA scheduling and
//! notification engine: typed window/schedule configuration, the prompt
//! instance state model, project context with event resolution, the error
//! taxonomy, and the traits the engine uses to reach storage, rule
//! evaluation, and the SMS transport.

pub mod config;
pub mod error;
pub mod instance;
pub mod project;
pub mod traits;

pub use config::{AppConfig, Schedule, SchedulePersistMode, StudyConfig, TransportConfig, Window};
pub use error::{EmaError, Result};
pub use instance::{PromptInstance, PromptStatus, TERMINAL_THRESHOLD};
pub use project::{EventId, EventRef, ProjectContext, RecordSnapshot, field_value};
pub use traits::{FormRepository, InstanceFields, RecordStore, RuleEvaluator, SmsTransport};
