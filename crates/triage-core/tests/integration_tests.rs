//! Triage Core Integration Tests
//!
//! Drive the lifecycle workflows end to end on an in-memory database with a
//! scripted model and a recording mailer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use triage_core::{
    Error, Result,
    assignment::AssignmentResolver,
    embedding::{EmbeddingAdapter, SimpleEmbedder},
    knowledge::{KnowledgeGraphStore, SimilarityIndex, SqliteKnowledgeGraph},
    llm::InferenceBackend,
    mail::{DeliveryReceipt, Mailer},
    storage::Database,
    tickets::{NewTicket, Priority, SqliteTicketStore, Ticket, TicketStatus, TicketStore, TriageUpdate},
    triage::TriageAnalyzer,
    users::{NewUser, Role, SqliteUserStore, User, UserStore},
    workflow::{
        Dispatcher, EngineConfig, EventEnvelope, RunStatus, SqliteRunJournal, TicketCreated,
        TicketCreatedWorkflow, TicketResolved, TicketResolvedWorkflow, TriageEvent,
        TriageServices, UserSignup, UserSignupWorkflow, WorkflowEngine,
    },
};

const GOOD_REPLY: &str = r#"```json
{"summary": "Navbar does not render", "priority": "HIGH", "helpfulNotes": "Check the useEffect dependencies", "relatedSkills": ["react"]}
```"#;

/// Model double. `None` entries in the script fail the call like an API outage.
struct ScriptedBackend {
    script: Mutex<VecDeque<Option<String>>>,
    fallback: String,
    rejecting: bool,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedBackend {
    fn replying(reply: &str) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: reply.to_string(),
            rejecting: false,
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Every call is refused the way a revoked key or empty balance is
    fn rejecting() -> Self {
        Self {
            rejecting: true,
            ..Self::replying("")
        }
    }

    fn with_script(mut self, script: Vec<Option<&str>>) -> Self {
        self.script = Mutex::new(script.into_iter().map(|r| r.map(String::from)).collect());
        self
    }

    fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    fn prompt(&self, n: usize) -> String {
        self.prompts.lock().unwrap()[n].clone()
    }
}

#[async_trait]
impl InferenceBackend for ScriptedBackend {
    async fn infer(&self, _system: &str, prompt: &str) -> Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if self.rejecting {
            return Err(Error::ConfigError("Invalid API key".into()));
        }
        match self.script.lock().unwrap().pop_front() {
            Some(Some(reply)) => Ok(reply),
            Some(None) => Err(Error::LLMError("service unavailable".into())),
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Mailer double that records every accepted message
#[derive(Default)]
struct RecordingMailer {
    fail: bool,
    sent: Mutex<Vec<(String, String)>>,
}

impl RecordingMailer {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for RecordingMailer {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<DeliveryReceipt> {
        if self.fail {
            return Err(Error::MailFailed {
                to: to.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.sent.lock().unwrap().push((to.to_string(), subject.to_string()));
        Ok(DeliveryReceipt {
            message_id: format!("<{}@test>", self.sent.lock().unwrap().len()),
            accepted: vec![to.to_string()],
        })
    }
}

struct Harness {
    // Held so the in-memory pools outlive the test body
    _db: Database,
    _index_db: Option<Database>,
    services: Arc<TriageServices>,
    engine: Arc<WorkflowEngine>,
    backend: Arc<ScriptedBackend>,
    mailer: Arc<RecordingMailer>,
}

impl Harness {
    async fn new(backend: ScriptedBackend) -> Self {
        Self::build(backend, RecordingMailer::default(), false).await
    }

    async fn build(backend: ScriptedBackend, mailer: RecordingMailer, closed_index: bool) -> Self {
        let db = Database::in_memory().await.expect("Failed to create database");
        let pool = db.pool().clone();

        // A similarity store whose connection is gone
        let index_db = if closed_index {
            let other = Database::in_memory().await.expect("Failed to create database");
            other.close().await;
            Some(other)
        } else {
            None
        };
        let index_pool = index_db
            .as_ref()
            .map(|d| d.pool().clone())
            .unwrap_or_else(|| pool.clone());

        let backend = Arc::new(backend);
        let mailer = Arc::new(mailer);
        let users: Arc<dyn UserStore> = Arc::new(SqliteUserStore::new(pool.clone()));

        let services = Arc::new(TriageServices {
            tickets: Arc::new(SqliteTicketStore::new(pool.clone())),
            users: users.clone(),
            graph: Arc::new(SqliteKnowledgeGraph::new(pool.clone())),
            index: SimilarityIndex::new(index_pool),
            embeddings: EmbeddingAdapter::new(Arc::new(SimpleEmbedder::default())),
            analyzer: TriageAnalyzer::new(backend.clone()),
            assignment: AssignmentResolver::new(users),
            mailer: mailer.clone(),
            similar_tickets: 3,
        });

        let engine = Arc::new(WorkflowEngine::new(
            Arc::new(SqliteRunJournal::new(pool)),
            EngineConfig {
                backoff_base: Duration::from_millis(1),
                step_timeout: Duration::from_secs(5),
            },
        ));

        Self {
            _db: db,
            _index_db: index_db,
            services,
            engine,
            backend,
            mailer,
        }
    }

    async fn user(&self, email: &str, role: Role, skills: &[&str]) -> User {
        self.services
            .users
            .create(&NewUser::new(email, role).with_skills(skills.iter().copied()))
            .await
            .unwrap()
    }

    async fn ticket(&self, title: &str, description: &str) -> Ticket {
        self.services
            .tickets
            .create(&NewTicket::new(title, description))
            .await
            .unwrap()
    }

    async fn reload(&self, id: &str) -> Ticket {
        self.services.tickets.find_by_id(id).await.unwrap().unwrap()
    }

    fn created(&self) -> TicketCreatedWorkflow {
        TicketCreatedWorkflow::new(self.services.clone())
    }
}

fn created_event(ticket_id: &str) -> EventEnvelope {
    EventEnvelope::new(TriageEvent::TicketCreated(TicketCreated {
        ticket_id: ticket_id.to_string(),
        title: String::new(),
        description: String::new(),
        created_by: None,
    }))
    .unwrap()
}

fn resolved_event(ticket_id: &str) -> EventEnvelope {
    EventEnvelope::new(TriageEvent::TicketResolved(TicketResolved {
        ticket_id: ticket_id.to_string(),
        title: String::new(),
        description: String::new(),
        resolution: String::new(),
        related_skills: Vec::new(),
    }))
    .unwrap()
}

#[tokio::test]
async fn test_created_ticket_is_triaged_assigned_and_notified() {
    let h = Harness::new(ScriptedBackend::replying(GOOD_REPLY)).await;
    let moderator = h.user("mod@example.com", Role::Moderator, &["React", "CSS"]).await;
    h.user("admin@example.com", Role::Admin, &[]).await;
    let ticket = h.ticket("Navbar broken", "The navbar does not render after login").await;

    let result = h.engine.run(&h.created(), &created_event(&ticket.id)).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.attempts, 1);
    let output = result.output.unwrap();
    assert_eq!(output["priority"], "high");
    assert_eq!(output["assignedTo"], moderator.id.as_str());
    assert_eq!(output["notified"], true);

    let stored = h.reload(&ticket.id).await;
    assert_eq!(stored.status, TicketStatus::InProgress);
    assert_eq!(stored.priority, Some(Priority::High));
    assert_eq!(stored.related_skills, vec!["react".to_string()]);
    assert_eq!(stored.helpful_notes.as_deref(), Some("Check the useEffect dependencies"));
    assert_eq!(stored.assigned_to.as_deref(), Some(moderator.id.as_str()));

    assert_eq!(
        h.mailer.sent(),
        vec![("mod@example.com".to_string(), "Ticket Assigned".to_string())]
    );
}

#[tokio::test]
async fn test_redelivered_event_does_not_repeat_side_effects() {
    let h = Harness::new(ScriptedBackend::replying(GOOD_REPLY)).await;
    h.user("mod@example.com", Role::Moderator, &["React"]).await;
    let ticket = h.ticket("Navbar broken", "The navbar does not render").await;

    let dispatcher = Dispatcher::with_triage_workflows(h.engine.clone(), h.services.clone(), 2);
    let first = dispatcher.dispatch_and_wait(created_event(&ticket.id)).await.unwrap();
    let second = dispatcher.dispatch_and_wait(created_event(&ticket.id)).await.unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(first[0].run_id, second[0].run_id);
    assert_eq!(first[0].output, second[0].output);
    assert_eq!(h.backend.calls(), 1);
    assert_eq!(h.mailer.sent().len(), 1);

    h.services.tickets.resolve(&ticket.id, "Fixed the effect").await.unwrap();
    dispatcher.dispatch_and_wait(resolved_event(&ticket.id)).await.unwrap();
    dispatcher.dispatch_and_wait(resolved_event(&ticket.id)).await.unwrap();
    dispatcher.shutdown().await;

    let stats = h.services.graph.stats().await.unwrap();
    assert_eq!(stats.ticket_nodes, 1);
    assert_eq!(stats.requires_edges, 1);
}

#[tokio::test]
async fn test_malformed_ticket_id_fails_without_retry() {
    let h = Harness::new(ScriptedBackend::replying(GOOD_REPLY)).await;
    let bystander = h.ticket("Existing", "Unrelated ticket").await;

    let result = h.engine.run(&h.created(), &created_event("not-a-uuid")).await.unwrap();

    assert_eq!(result.status, RunStatus::FailedNonRetriable);
    assert_eq!(result.attempts, 1);
    assert!(result.error.unwrap().contains("E001"));
    assert_eq!(h.backend.calls(), 0);
    assert_eq!(h.reload(&bystander.id).await.status, TicketStatus::Created);
}

#[tokio::test]
async fn test_unknown_ticket_fails_without_retry() {
    let h = Harness::new(ScriptedBackend::replying(GOOD_REPLY)).await;

    let result = h
        .engine
        .run(&h.created(), &created_event("6f9619ff-8b86-d011-b42d-00cf4fc964ff"))
        .await
        .unwrap();

    assert_eq!(result.status, RunStatus::FailedNonRetriable);
    assert!(result.error.unwrap().contains("E002"));
}

#[tokio::test]
async fn test_unreachable_similarity_store_degrades_to_empty_context() {
    let h = Harness::build(
        ScriptedBackend::replying(GOOD_REPLY),
        RecordingMailer::default(),
        true,
    )
    .await;
    h.user("admin@example.com", Role::Admin, &[]).await;
    let ticket = h.ticket("Login fails", "Users cannot log in").await;

    let result = h.engine.run(&h.created(), &created_event(&ticket.id)).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(h.backend.calls(), 1);
    assert!(!h.backend.prompt(0).contains("Similar tickets resolved in the past"));
    assert!(h.backend.prompt(0).contains("- Title: Login fails"));
}

#[tokio::test]
async fn test_resolved_tickets_ground_later_analysis() {
    let h = Harness::new(ScriptedBackend::replying(GOOD_REPLY)).await;
    let old = h.ticket("Navbar not rendering", "React navbar disappears after login").await;
    h.services.tickets.resolve(&old.id, "Fixed a stale useEffect dependency").await.unwrap();
    let resolved = TicketResolvedWorkflow::new(h.services.clone());
    assert!(h.engine.run(&resolved, &resolved_event(&old.id)).await.unwrap().succeeded());

    let new = h.ticket("Navbar missing", "The React navbar disappears after login").await;
    let result = h.engine.run(&h.created(), &created_event(&new.id)).await.unwrap();

    assert!(result.succeeded());
    let prompt = h.backend.prompt(0);
    assert!(prompt.contains("Similar tickets resolved in the past"));
    assert!(prompt.contains("Fixed a stale useEffect dependency"));
}

#[tokio::test]
async fn test_unparseable_analysis_degrades_on_final_attempt() {
    let h = Harness::new(ScriptedBackend::replying("Sorry, I can't help with that.")).await;
    let admin = h.user("admin@example.com", Role::Admin, &[]).await;
    let ticket = h.ticket("Printer jam", "The office printer is jammed").await;

    let result = h.engine.run(&h.created(), &created_event(&ticket.id)).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.attempts, 3);
    assert_eq!(h.backend.calls(), 3);

    let stored = h.reload(&ticket.id).await;
    assert_eq!(stored.status, TicketStatus::Todo);
    assert_eq!(stored.priority, None);
    assert!(stored.related_skills.is_empty());
    assert_eq!(stored.assigned_to.as_deref(), Some(admin.id.as_str()));
}

#[tokio::test]
async fn test_rejected_model_credentials_still_assign_admin() {
    let h = Harness::new(ScriptedBackend::rejecting()).await;
    let admin = h.user("admin@example.com", Role::Admin, &[]).await;
    let ticket = h.ticket("Billing page blank", "The billing page renders nothing").await;

    let result = h.engine.run(&h.created(), &created_event(&ticket.id)).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.attempts, 1);
    assert_eq!(h.backend.calls(), 1);

    let stored = h.reload(&ticket.id).await;
    assert_eq!(stored.priority, None);
    assert_eq!(stored.assigned_to.as_deref(), Some(admin.id.as_str()));
    assert_eq!(
        h.mailer.sent(),
        vec![("admin@example.com".to_string(), "Ticket Assigned".to_string())]
    );
}

#[tokio::test]
async fn test_completed_steps_are_not_re_executed_on_retry() {
    let backend = ScriptedBackend::replying(GOOD_REPLY).with_script(vec![None]);
    let h = Harness::new(backend).await;
    h.user("mod@example.com", Role::Moderator, &["react"]).await;
    let ticket = h.ticket("Navbar broken", "The navbar does not render").await;

    let result = h.engine.run(&h.created(), &created_event(&ticket.id)).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.attempts, 2);
    assert_eq!(h.backend.calls(), 2);

    let steps = h.engine.journal().steps(&result.run_id).await.unwrap();
    let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "fetch-ticket",
            "update-ticket-status",
            "find-similar-tickets",
            "analyze-ticket",
            "ai-processing",
            "assign-moderator",
            "send-email-notification",
        ]
    );
    assert_eq!(steps[0].attempt, 1);
    assert_eq!(steps[3].attempt, 2);
    assert_eq!(h.mailer.sent().len(), 1);
}

#[tokio::test]
async fn test_priority_is_normalized() {
    let reply = r#"{"summary": "s", "priority": "urgent!!", "helpfulNotes": null, "relatedSkills": []}"#;
    let h = Harness::new(ScriptedBackend::replying(reply)).await;
    let ticket = h.ticket("Something odd", "Hard to say").await;

    h.engine.run(&h.created(), &created_event(&ticket.id)).await.unwrap();

    assert_eq!(h.reload(&ticket.id).await.priority, Some(Priority::Medium));
}

#[tokio::test]
async fn test_no_moderator_or_admin_leaves_ticket_unassigned() {
    let h = Harness::new(ScriptedBackend::replying(GOOD_REPLY)).await;
    h.user("someone@example.com", Role::User, &["React"]).await;
    let ticket = h.ticket("Navbar broken", "The navbar does not render").await;

    let result = h.engine.run(&h.created(), &created_event(&ticket.id)).await.unwrap();

    assert!(result.succeeded());
    let output = result.output.unwrap();
    assert!(output["assignedTo"].is_null());
    assert_eq!(output["notified"], false);
    assert_eq!(h.reload(&ticket.id).await.assigned_to, None);
    assert!(h.mailer.sent().is_empty());
}

#[tokio::test]
async fn test_failed_assignment_mail_does_not_fail_the_run() {
    let h = Harness::build(
        ScriptedBackend::replying(GOOD_REPLY),
        RecordingMailer::failing(),
        false,
    )
    .await;
    let moderator = h.user("mod@example.com", Role::Moderator, &["React"]).await;
    let ticket = h.ticket("Navbar broken", "The navbar does not render").await;

    let result = h.engine.run(&h.created(), &created_event(&ticket.id)).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.output.unwrap()["notified"], false);
    assert_eq!(h.reload(&ticket.id).await.assigned_to, Some(moderator.id));
}

#[tokio::test]
async fn test_resolved_ticket_is_stored_with_its_skills() {
    let h = Harness::new(ScriptedBackend::replying(GOOD_REPLY)).await;
    let ticket = h.ticket("Slow queries", "The dashboard takes a minute to load").await;
    h.services
        .tickets
        .apply_triage(
            &ticket.id,
            &TriageUpdate {
                priority: Priority::High,
                helpful_notes: None,
                related_skills: vec!["PostgreSQL".into(), "Indexing".into()],
            },
        )
        .await
        .unwrap();
    h.services.tickets.resolve(&ticket.id, "Added a composite index").await.unwrap();

    let resolved = TicketResolvedWorkflow::new(h.services.clone());
    let result = h.engine.run(&resolved, &resolved_event(&ticket.id)).await.unwrap();

    assert_eq!(result.status, RunStatus::Succeeded);
    assert_eq!(result.output.unwrap()["dimensions"], 768);

    let node = h.services.graph.get_ticket_node(&ticket.id).await.unwrap().unwrap();
    assert_eq!(node.title, "Slow queries");
    assert_eq!(node.resolution, "Added a composite index");
    assert_eq!(node.embedding.len(), 768);

    let skills = h.services.graph.skills_for_ticket(&ticket.id).await.unwrap();
    assert_eq!(skills, vec!["Indexing".to_string(), "PostgreSQL".to_string()]);
    assert!(h.services.index.exists().await.unwrap());
}

#[tokio::test]
async fn test_resolved_event_without_resolution_fails_without_retry() {
    let h = Harness::new(ScriptedBackend::replying(GOOD_REPLY)).await;
    let ticket = h.ticket("Open ticket", "Still open").await;

    let resolved = TicketResolvedWorkflow::new(h.services.clone());
    let result = h.engine.run(&resolved, &resolved_event(&ticket.id)).await.unwrap();

    assert_eq!(result.status, RunStatus::FailedNonRetriable);
    assert_eq!(h.services.graph.stats().await.unwrap().ticket_nodes, 0);
}

#[tokio::test]
async fn test_signup_sends_welcome_mail() {
    let h = Harness::new(ScriptedBackend::replying(GOOD_REPLY)).await;
    h.user("new@example.com", Role::User, &[]).await;

    let signup = UserSignupWorkflow::new(h.services.clone());
    let event = EventEnvelope::new(TriageEvent::UserSignup(UserSignup {
        email: "new@example.com".into(),
    }))
    .unwrap();
    let result = h.engine.run(&signup, &event).await.unwrap();

    assert!(result.succeeded());
    assert_eq!(
        h.mailer.sent(),
        vec![("new@example.com".to_string(), "Welcome to the app".to_string())]
    );
}

#[tokio::test]
async fn test_signup_for_missing_user_fails_without_retry() {
    let h = Harness::new(ScriptedBackend::replying(GOOD_REPLY)).await;

    let signup = UserSignupWorkflow::new(h.services.clone());
    let event = EventEnvelope::new(TriageEvent::UserSignup(UserSignup {
        email: "ghost@example.com".into(),
    }))
    .unwrap();
    let result = h.engine.run(&signup, &event).await.unwrap();

    assert_eq!(result.status, RunStatus::FailedNonRetriable);
    assert_eq!(result.attempts, 1);
    assert!(result.error.unwrap().contains("E003"));
}

#[tokio::test]
async fn test_persistent_mail_failure_exhausts_retries() {
    let h = Harness::build(
        ScriptedBackend::replying(GOOD_REPLY),
        RecordingMailer::failing(),
        false,
    )
    .await;
    h.user("new@example.com", Role::User, &[]).await;

    let signup = UserSignupWorkflow::new(h.services.clone()).with_retries(1);
    let event = EventEnvelope::new(TriageEvent::UserSignup(UserSignup {
        email: "new@example.com".into(),
    }))
    .unwrap();
    let result = h.engine.run(&signup, &event).await.unwrap();

    assert_eq!(result.status, RunStatus::FailedExhaustedRetries);
    assert_eq!(result.attempts, 2);
    assert!(result.error.unwrap().contains("E700"));

    let steps = h.engine.journal().steps(&result.run_id).await.unwrap();
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].name, "get-user-email");
}
