//! Workflow orchestration
//!
//! Lifecycle events are turned into durable runs of workflow functions. Each
//! function is a sequence of named steps; the engine memoizes step outputs in
//! the run journal and retries the whole run on retriable failures.
//!
//! # Architecture
//!
//! - `events`: event payloads and envelopes with stable ids
//! - `run`: run and step records
//! - `journal`: persistence of runs and step outputs ([`RunJournal`])
//! - `engine`: attempt loop, error classification and step memoization
//! - `pipelines`: the ticket-created, ticket-resolved and user-signup workflows
//! - `dispatcher`: one task per run on a tracked task set
//!
//! # Usage
//!
//! ```ignore
//! let services = Arc::new(TriageServices::sqlite(pool.clone(), &config, llm, embedder, mailer));
//! let journal = Arc::new(SqliteRunJournal::new(pool));
//! let engine = Arc::new(WorkflowEngine::new(journal, EngineConfig::from(&config.workflow)));
//! let dispatcher = Dispatcher::with_triage_workflows(engine, services, config.workflow.retries);
//!
//! let envelope = EventEnvelope::new(TriageEvent::TicketCreated(created))?;
//! let results = dispatcher.dispatch_and_wait(envelope).await?;
//! ```

mod dispatcher;
mod engine;
mod events;
mod journal;
mod pipelines;
mod run;

pub use dispatcher::Dispatcher;
pub use engine::{DEFAULT_RETRIES, EngineConfig, StepContext, WorkflowEngine, WorkflowFunction};
pub use events::{
    EventEnvelope, TicketCreated, TicketResolved, TriageEvent, UserSignup, derive_event_id,
};
pub use journal::{RunJournal, SqliteRunJournal};
pub use pipelines::{
    TicketCreatedWorkflow, TicketResolvedWorkflow, TriageServices, UserSignupWorkflow,
};
pub use run::{RunRecord, RunResult, RunStatus, StepRecord};
