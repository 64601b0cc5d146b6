//! Campaign automation flow engine: versioned email flows (email, delay,
//! condition and goal nodes) executed per lead by recipient cursors, driven
//! by a due-timer scheduler and by inbound engagement events.

pub mod delivery;
pub mod engine;
pub mod evaluator;
pub mod executor;
pub mod graph;
pub mod ingestor;
pub mod journal;
pub mod scheduler;
pub mod state_machine;
pub mod stats;
pub mod store;
pub mod types;
pub mod validator;

pub use delivery::{LogMailer, Mailer, SendError, TemplateLibrary, TemplateRenderer};
pub use engine::{EngineSnapshot, FlowEngine, IngestReport};
pub use evaluator::{ConditionEvaluator, ConditionOutcome};
pub use executor::{StepOutcome, Trigger};
pub use graph::FlowGraph;
pub use ingestor::{SignalKind, TrackingSignal};
pub use journal::{Journal, JournalEntry};
pub use scheduler::{Scheduler, TickReport};
pub use validator::validate;
