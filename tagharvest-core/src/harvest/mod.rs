//! Batch resolution runtime.
//!
//! A run registers every tag as Pending, then three loops share the work:
//! admission subscribes bounded batches, drain records values and retires
//! finished tags, and the supervisor keeps the session alive. See
//! [`HarvestProcessor`] for the entry point.

mod admission;
pub mod budget;
pub mod config;
mod drain;
pub mod processor;
pub mod progress;
pub mod registry;
mod runtime;
pub mod sink;
mod stuck;
pub mod supervisor;

pub use budget::AdmissionBudget;
pub use config::{
    HarvestConfig, InputConfig, OutputConfig, ReconnectPolicy, ScheduleConfig, ServiceConfig,
    SessionSettings, StuckTagPolicy,
};
pub use processor::{HarvestProcessor, RunOutcome, RunReport};
pub use progress::format_elapsed;
pub use registry::{
    Completion, CompletionEntry, CompletionRegistry, EntryStatus, RegistrySummary,
};
pub use sink::NotificationSink;
pub use supervisor::{ConnectionState, ConnectionStatus};
