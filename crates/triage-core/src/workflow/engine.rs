//! Durable, retrying execution of workflow functions
//!
//! A run is identified by `<function-id>:<event-id>`. Each attempt replays the
//! function body from the top; steps that already have a recorded output
//! return it without running again, so an attempt effectively resumes at the
//! first incomplete step.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::events::{EventEnvelope, TriageEvent};
use super::journal::RunJournal;
use super::run::{RunRecord, RunResult, RunStatus};
use crate::config::WorkflowConfig;
use crate::error::{Error, ErrorClass, Result};

/// Retry bound used when a function does not override it
pub const DEFAULT_RETRIES: u32 = 2;

/// A multi-step pipeline triggered by one kind of event
#[async_trait]
pub trait WorkflowFunction: Send + Sync {
    /// Stable id, the first half of every run id
    fn id(&self) -> &'static str;

    /// Name of the event this function handles
    fn event_name(&self) -> &'static str;

    /// Additional attempts after a retriable failure
    fn retries(&self) -> u32 {
        DEFAULT_RETRIES
    }

    async fn handle(&self, event: &TriageEvent, step: &StepContext) -> Result<serde_json::Value>;
}

/// Handle passed to a function body for running named, memoized steps
pub struct StepContext {
    run_id: String,
    attempt: u32,
    max_attempts: u32,
    step_timeout: Duration,
    journal: Arc<dyn RunJournal>,
}

impl StepContext {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// 1-based attempt number
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// True when a retriable failure in this attempt ends the run
    pub fn is_final_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Run `action` as the step `name`, or return its recorded output.
    ///
    /// The output is recorded before it is returned, and what callers receive
    /// is always the recorded value.
    pub async fn run<T, F, Fut>(&self, name: &str, action: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
    {
        if let Some(cached) = self.journal.completed_step(&self.run_id, name).await? {
            debug!(run_id = %self.run_id, step = %name, "Step memoized, skipping");
            return Ok(serde_json::from_value(cached)?);
        }

        debug!(run_id = %self.run_id, step = %name, attempt = self.attempt, "Running step");

        let output = match tokio::time::timeout(self.step_timeout, action()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::Timeout {
                    operation: name.to_string(),
                    secs: self.step_timeout.as_secs(),
                });
            }
        };

        let value = serde_json::to_value(&output)?;
        let stored = self
            .journal
            .record_step(&self.run_id, name, &value, self.attempt)
            .await?;

        info!(run_id = %self.run_id, step = %name, "Step completed");
        Ok(serde_json::from_value(stored)?)
    }
}

/// Timing knobs for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backoff_base: Duration,
    pub step_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&WorkflowConfig::default())
    }
}

impl From<&WorkflowConfig> for EngineConfig {
    fn from(config: &WorkflowConfig) -> Self {
        Self {
            backoff_base: Duration::from_millis(config.backoff_base_ms),
            step_timeout: Duration::from_secs(config.step_timeout_secs.max(1)),
        }
    }
}

/// Executes runs against a [`RunJournal`]
#[derive(Clone)]
pub struct WorkflowEngine {
    journal: Arc<dyn RunJournal>,
    config: EngineConfig,
}

impl WorkflowEngine {
    pub fn new(journal: Arc<dyn RunJournal>, config: EngineConfig) -> Self {
        Self { journal, config }
    }

    pub fn journal(&self) -> &Arc<dyn RunJournal> {
        &self.journal
    }

    pub fn run_id(function: &dyn WorkflowFunction, envelope: &EventEnvelope) -> String {
        format!("{}:{}", function.id(), envelope.id)
    }

    /// Execute `function` for `envelope` until it succeeds, fails for good or
    /// runs out of attempts.
    ///
    /// Step failures are reported in the returned [`RunResult`]. An `Err` means
    /// the journal itself could not be read or written.
    pub async fn run(
        &self,
        function: &dyn WorkflowFunction,
        envelope: &EventEnvelope,
    ) -> Result<RunResult> {
        if envelope.name() != function.event_name() {
            return Err(Error::InvalidPayload(format!(
                "{} does not handle {}",
                function.id(),
                envelope.name()
            )));
        }

        let run_id = Self::run_id(function, envelope);
        let span = info_span!("run", run_id = %run_id, function = function.id());

        self.execute(function, envelope, run_id).instrument(span).await
    }

    async fn execute(
        &self,
        function: &dyn WorkflowFunction,
        envelope: &EventEnvelope,
        run_id: String,
    ) -> Result<RunResult> {
        let record = self.journal.begin_run(&run_id, function.id(), envelope).await?;

        if record.status.is_terminal() {
            info!(status = %record.status, "Run already finished, returning recorded result");
            return Ok(RunResult::from(&record));
        }

        let mut attempt = record.attempts + 1;
        // A run re-entered after a crash gets at least one more attempt
        let max_attempts = (function.retries() + 1).max(attempt);

        loop {
            self.journal.record_attempt(&run_id, attempt).await?;
            info!(attempt, max_attempts, "Starting attempt");

            let step = StepContext {
                run_id: run_id.clone(),
                attempt,
                max_attempts,
                step_timeout: self.config.step_timeout,
                journal: self.journal.clone(),
            };

            let error = match function.handle(&envelope.event, &step).await {
                Ok(output) => {
                    self.journal
                        .finish_run(&run_id, RunStatus::Succeeded, Some(&output), None)
                        .await?;
                    info!(attempt, "Run succeeded");
                    return self.result(&run_id).await;
                }
                Err(e) => e,
            };

            let message = format!("[{}] {}", error.code(), error);

            match error.class() {
                ErrorClass::NonRetriable => {
                    error!(attempt, error = %message, "Run failed with non-retriable error");
                    self.journal
                        .finish_run(&run_id, RunStatus::FailedNonRetriable, None, Some(&message))
                        .await?;
                    return self.result(&run_id).await;
                }
                ErrorClass::Retriable if attempt >= max_attempts => {
                    error!(attempt, error = %message, "Run exhausted its retries");
                    self.journal
                        .finish_run(&run_id, RunStatus::FailedExhaustedRetries, None, Some(&message))
                        .await?;
                    return self.result(&run_id).await;
                }
                ErrorClass::Retriable => {
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn result(&self, run_id: &str) -> Result<RunResult> {
        let record: RunRecord = self
            .journal
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::Other(format!("Run '{}' not found", run_id)))?;
        Ok(RunResult::from(&record))
    }

    /// Exponential backoff with up to 50% jitter
    fn backoff(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base.as_millis() as u64;
        let delay = base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
        let jitter = if delay > 1 {
            rand::thread_rng().gen_range(0..delay / 2)
        } else {
            0
        };
        Duration::from_millis(delay + jitter)
    }
}
