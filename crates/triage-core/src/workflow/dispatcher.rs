//! Fan-out of events to registered workflow functions

use std::sync::Arc;

use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::engine::{WorkflowEngine, WorkflowFunction};
use super::events::EventEnvelope;
use super::pipelines::{
    TicketCreatedWorkflow, TicketResolvedWorkflow, TriageServices, UserSignupWorkflow,
};
use super::run::RunResult;
use crate::error::{Error, Result};

/// Routes each event to every function registered for its name, one task per run
#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<WorkflowEngine>,
    functions: Vec<Arc<dyn WorkflowFunction>>,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self {
            engine,
            functions: Vec::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Dispatcher with the three lifecycle workflows registered
    pub fn with_triage_workflows(
        engine: Arc<WorkflowEngine>,
        services: Arc<TriageServices>,
        retries: u32,
    ) -> Self {
        let mut dispatcher = Self::new(engine);
        dispatcher.register(Arc::new(
            TicketCreatedWorkflow::new(services.clone()).with_retries(retries),
        ));
        dispatcher.register(Arc::new(
            TicketResolvedWorkflow::new(services.clone()).with_retries(retries),
        ));
        dispatcher.register(Arc::new(UserSignupWorkflow::new(services).with_retries(retries)));
        dispatcher
    }

    pub fn register(&mut self, function: Arc<dyn WorkflowFunction>) {
        debug!(function = function.id(), event = function.event_name(), "Registered workflow function");
        self.functions.push(function);
    }

    /// Spawn one run per matching function. The handles resolve to the run results.
    pub fn dispatch(&self, envelope: EventEnvelope) -> Vec<JoinHandle<Result<RunResult>>> {
        let envelope = Arc::new(envelope);
        let handles: Vec<_> = self
            .functions
            .iter()
            .filter(|f| f.event_name() == envelope.name())
            .map(|function| {
                let engine = self.engine.clone();
                let function = function.clone();
                let envelope = envelope.clone();
                self.tracker
                    .spawn(async move { engine.run(function.as_ref(), &envelope).await })
            })
            .collect();

        info!(event = envelope.name(), event_id = %envelope.id, runs = handles.len(), "Event dispatched");
        handles
    }

    /// Dispatch and wait for every run to finish
    pub async fn dispatch_and_wait(&self, envelope: EventEnvelope) -> Result<Vec<RunResult>> {
        join_all(self.dispatch(envelope))
            .await
            .into_iter()
            .map(|joined| joined.map_err(|e| Error::Other(format!("Run task failed: {}", e)))?)
            .collect()
    }

    /// Stop accepting runs and wait for in-flight ones
    pub async fn shutdown(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        info!("Dispatcher drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;
    use crate::workflow::engine::{EngineConfig, StepContext};
    use crate::workflow::events::{TriageEvent, UserSignup};
    use crate::workflow::journal::SqliteRunJournal;
    use crate::workflow::run::RunStatus;
    use async_trait::async_trait;

    struct Echo(&'static str);

    #[async_trait]
    impl WorkflowFunction for Echo {
        fn id(&self) -> &'static str {
            self.0
        }
        fn event_name(&self) -> &'static str {
            TriageEvent::USER_SIGNUP
        }
        async fn handle(&self, event: &TriageEvent, step: &StepContext) -> Result<serde_json::Value> {
            let name = event.name();
            step.run("echo", move || async move { Ok::<_, Error>(name.to_string()) })
                .await
                .map(serde_json::Value::String)
        }
    }

    #[tokio::test]
    async fn test_dispatch_fans_out_to_matching_functions() {
        let db = Database::in_memory().await.unwrap();
        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(SqliteRunJournal::new(db.pool().clone())),
            EngineConfig::default(),
        ));

        let mut dispatcher = Dispatcher::new(engine.clone());
        dispatcher.register(Arc::new(Echo("first")));
        dispatcher.register(Arc::new(Echo("second")));

        let envelope = EventEnvelope::new(TriageEvent::UserSignup(UserSignup {
            email: "a@example.com".into(),
        }))
        .unwrap();

        let results = dispatcher.dispatch_and_wait(envelope.clone()).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.status == RunStatus::Succeeded));
        assert!(results[0].run_id.starts_with("first:"));

        dispatcher.shutdown().await;

        let runs = engine.journal().list_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
    }
}
