//! The ticket lifecycle workflows

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::SqlitePool;
use tracing::{info, warn};

use super::engine::{DEFAULT_RETRIES, StepContext, WorkflowFunction};
use super::events::TriageEvent;
use crate::assignment::AssignmentResolver;
use crate::config::Config;
use crate::embedding::{EmbeddingAdapter, EmbeddingBackend};
use crate::error::{Error, Result};
use crate::knowledge::{
    IndexConfig, KnowledgeGraphStore, SimilarTicket, SimilarityIndex, SqliteKnowledgeGraph,
};
use crate::llm::InferenceBackend;
use crate::mail::{DeliveryReceipt, Mailer};
use crate::tickets::{
    SqliteTicketStore, Ticket, TicketStatus, TicketStore, TriageUpdate, parse_ticket_id,
};
use crate::triage::{Judgement, TriageAnalyzer};
use crate::users::{SqliteUserStore, User, UserStore};

/// Everything the workflows talk to
#[derive(Clone)]
pub struct TriageServices {
    pub tickets: Arc<dyn TicketStore>,
    pub users: Arc<dyn UserStore>,
    pub graph: Arc<dyn KnowledgeGraphStore>,
    pub index: SimilarityIndex,
    pub embeddings: EmbeddingAdapter,
    pub analyzer: TriageAnalyzer,
    pub assignment: AssignmentResolver,
    pub mailer: Arc<dyn Mailer>,
    /// Neighbors fetched as analysis context
    pub similar_tickets: usize,
}

impl TriageServices {
    /// Wire SQLite-backed stores on `pool` to the given capabilities
    pub fn sqlite(
        pool: SqlitePool,
        config: &Config,
        inference: Arc<dyn InferenceBackend>,
        embedder: Arc<dyn EmbeddingBackend>,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let users: Arc<dyn UserStore> = Arc::new(SqliteUserStore::new(pool.clone()));
        let graph = SqliteKnowledgeGraph::new(pool.clone())
            .with_edge_policy(config.graph.skill_edge_policy);

        Self {
            tickets: Arc::new(SqliteTicketStore::new(pool.clone())),
            assignment: AssignmentResolver::new(users.clone()),
            users,
            graph: Arc::new(graph),
            index: SimilarityIndex::with_config(
                pool,
                IndexConfig {
                    dimensions: config.embedding.dimensions,
                    ..IndexConfig::default()
                },
            ),
            embeddings: EmbeddingAdapter::with_dimensions(embedder, config.embedding.dimensions),
            analyzer: TriageAnalyzer::new(inference),
            mailer,
            similar_tickets: config.workflow.similar_tickets,
        }
    }
}

fn unexpected_event(function: &str, event: &TriageEvent) -> Error {
    Error::InvalidPayload(format!("{} received {}", function, event.name()))
}

/// `ticket/created`: triage, assign and notify
pub struct TicketCreatedWorkflow {
    services: Arc<TriageServices>,
    retries: u32,
}

impl TicketCreatedWorkflow {
    pub const ID: &'static str = "on-ticket-created";

    pub fn new(services: Arc<TriageServices>) -> Self {
        Self {
            services,
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

#[async_trait]
impl WorkflowFunction for TicketCreatedWorkflow {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn event_name(&self) -> &'static str {
        TriageEvent::TICKET_CREATED
    }

    fn retries(&self) -> u32 {
        self.retries
    }

    async fn handle(&self, event: &TriageEvent, step: &StepContext) -> Result<serde_json::Value> {
        let TriageEvent::TicketCreated(data) = event else {
            return Err(unexpected_event(Self::ID, event));
        };

        let ticket_id = parse_ticket_id(&data.ticket_id)?;
        let id = ticket_id.as_str();
        let s = self.services.as_ref();

        let ticket: Ticket = step
            .run("fetch-ticket", move || async move {
                s.tickets
                    .find_by_id(id)
                    .await?
                    .ok_or_else(|| Error::TicketNotFound(id.to_string()))
            })
            .await?;

        let _advanced: bool = step
            .run("update-ticket-status", move || async move {
                s.tickets.update_status(id, TicketStatus::Todo).await
            })
            .await?;

        let ticket_ref = &ticket;
        let similar: Vec<SimilarTicket> = step
            .run("find-similar-tickets", move || async move {
                Ok(find_similar(s, ticket_ref).await)
            })
            .await?;

        let similar_ref = similar.as_slice();
        let judgement: Option<Judgement> = match step
            .run("analyze-ticket", move || async move {
                s.analyzer.analyze(ticket_ref, similar_ref).await
            })
            .await
        {
            Ok(judgement) => Some(judgement),
            Err(e @ (Error::InvalidTicketId(_) | Error::TicketNotFound(_))) => return Err(e),
            // Assignment must still happen when the model is unusable
            Err(e) if !e.is_retriable() || step.is_final_attempt() => {
                warn!(
                    ticket_id = %id,
                    error = %e,
                    attempt = step.attempt(),
                    "Analysis failed, continuing without it"
                );
                None
            }
            Err(e) => return Err(e),
        };

        let judgement_ref = &judgement;
        let skills: Vec<String> = step
            .run("ai-processing", move || async move {
                let Some(judgement) = judgement_ref else {
                    return Ok(Vec::new());
                };
                let update = TriageUpdate {
                    priority: judgement.priority,
                    helpful_notes: judgement.helpful_notes.clone(),
                    related_skills: judgement.related_skills.clone(),
                };
                s.tickets.apply_triage(id, &update).await?;
                Ok(judgement.related_skills.clone())
            })
            .await?;

        let skills_ref = skills.as_slice();
        let assignee: Option<User> = step
            .run("assign-moderator", move || async move {
                let user = s.assignment.resolve(skills_ref).await?;
                s.tickets
                    .update_assigned_to(id, user.as_ref().map(|u| u.id.as_str()))
                    .await?;
                Ok(user)
            })
            .await?;

        let assignee_ref = &assignee;
        let receipt: Option<DeliveryReceipt> = step
            .run("send-email-notification", move || async move {
                let Some(user) = assignee_ref else {
                    return Ok(None);
                };
                Ok(notify_assignee(s, id, user).await)
            })
            .await?;

        Ok(json!({
            "success": true,
            "ticketId": id,
            "priority": judgement.as_ref().map(|j| j.priority),
            "relatedSkills": skills,
            "assignedTo": assignee.as_ref().map(|u| u.id.clone()),
            "notified": receipt.is_some(),
        }))
    }
}

/// Nearest resolved tickets for `ticket`. Every failure degrades to no context.
async fn find_similar(s: &TriageServices, ticket: &Ticket) -> Vec<SimilarTicket> {
    let vector = match s.embeddings.embed_query(ticket).await {
        Ok(vector) => vector,
        Err(e) => {
            warn!(ticket_id = %ticket.id, error = %e, "Query embedding failed, using empty context");
            return Vec::new();
        }
    };

    if let Err(e) = s.index.ensure_index().await {
        warn!(ticket_id = %ticket.id, error = %e, "Vector index unavailable, using empty context");
        return Vec::new();
    }

    let similar = s.index.query(&vector, s.similar_tickets).await;
    info!(ticket_id = %ticket.id, found = similar.len(), "Similar tickets retrieved");
    similar
}

/// Send the assignment mail. A failed send is logged and reported as `None`.
async fn notify_assignee(s: &TriageServices, id: &str, user: &User) -> Option<DeliveryReceipt> {
    let ticket = match s.tickets.find_by_id(id).await {
        Ok(Some(ticket)) => ticket,
        Ok(None) => {
            warn!(ticket_id = %id, "Ticket disappeared before notification");
            return None;
        }
        Err(e) => {
            warn!(ticket_id = %id, error = %e, "Could not load ticket for notification");
            return None;
        }
    };

    let mut body = format!("A new ticket is assigned to you:\n{}", ticket.title);
    if let Some(priority) = ticket.priority {
        body.push_str(&format!("\nPriority: {}", priority));
    }
    if let Some(notes) = ticket.helpful_notes.as_deref() {
        body.push_str(&format!("\n\nNotes:\n{}", notes));
    }

    match s.mailer.send(&user.email, "Ticket Assigned", &body).await {
        Ok(receipt) => Some(receipt),
        Err(e) => {
            warn!(ticket_id = %id, to = %user.email, error = %e, "Assignment mail failed");
            None
        }
    }
}

/// Fields written to the knowledge graph for a resolved ticket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResolvedDetails {
    title: String,
    description: String,
    resolution: String,
    related_skills: Vec<String>,
}

/// `ticket/resolved`: embed the resolution and store it in the knowledge graph
pub struct TicketResolvedWorkflow {
    services: Arc<TriageServices>,
    retries: u32,
}

impl TicketResolvedWorkflow {
    pub const ID: &'static str = "on-ticket-resolved";

    pub fn new(services: Arc<TriageServices>) -> Self {
        Self {
            services,
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

#[async_trait]
impl WorkflowFunction for TicketResolvedWorkflow {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn event_name(&self) -> &'static str {
        TriageEvent::TICKET_RESOLVED
    }

    fn retries(&self) -> u32 {
        self.retries
    }

    async fn handle(&self, event: &TriageEvent, step: &StepContext) -> Result<serde_json::Value> {
        let TriageEvent::TicketResolved(data) = event else {
            return Err(unexpected_event(Self::ID, event));
        };

        let ticket_id = parse_ticket_id(&data.ticket_id)?;
        let id = ticket_id.as_str();
        let s = self.services.as_ref();

        // Events published without the ticket text are completed from the store
        let details = if data.title.trim().is_empty() || data.resolution.trim().is_empty() {
            step.run("fetch-ticket", move || async move {
                let ticket = s
                    .tickets
                    .find_by_id(id)
                    .await?
                    .ok_or_else(|| Error::TicketNotFound(id.to_string()))?;
                let resolution = ticket.resolution.ok_or_else(|| {
                    Error::InvalidPayload(format!("ticket {} has no resolution", id))
                })?;
                Ok(ResolvedDetails {
                    title: ticket.title,
                    description: ticket.description,
                    resolution,
                    related_skills: ticket.related_skills,
                })
            })
            .await?
        } else {
            ResolvedDetails {
                title: data.title.clone(),
                description: data.description.clone(),
                resolution: data.resolution.clone(),
                related_skills: data.related_skills.clone(),
            }
        };

        step.run("init-vector-index", move || async move { s.index.ensure_index().await })
            .await?;

        let details_ref = &details;
        let vector: Vec<f32> = step
            .run("generate-embedding", move || async move {
                s.embeddings
                    .embed_resolution(
                        &details_ref.title,
                        &details_ref.description,
                        &details_ref.resolution,
                    )
                    .await
            })
            .await?;

        let vector_ref = vector.as_slice();
        step.run("store-in-graph", move || async move {
            s.graph
                .upsert_ticket(
                    id,
                    &details_ref.title,
                    &details_ref.resolution,
                    &details_ref.related_skills,
                    vector_ref,
                )
                .await
        })
        .await?;

        Ok(json!({
            "success": true,
            "ticketId": id,
            "relatedSkills": details.related_skills,
            "dimensions": vector.len(),
        }))
    }
}

/// `user/signup`: welcome the new user
pub struct UserSignupWorkflow {
    services: Arc<TriageServices>,
    retries: u32,
}

impl UserSignupWorkflow {
    pub const ID: &'static str = "on-user-signup";

    pub fn new(services: Arc<TriageServices>) -> Self {
        Self {
            services,
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

#[async_trait]
impl WorkflowFunction for UserSignupWorkflow {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn event_name(&self) -> &'static str {
        TriageEvent::USER_SIGNUP
    }

    fn retries(&self) -> u32 {
        self.retries
    }

    async fn handle(&self, event: &TriageEvent, step: &StepContext) -> Result<serde_json::Value> {
        let TriageEvent::UserSignup(data) = event else {
            return Err(unexpected_event(Self::ID, event));
        };

        let email = data.email.as_str();
        let s = self.services.as_ref();

        let user: User = step
            .run("get-user-email", move || async move {
                s.users
                    .find_by_email(email)
                    .await?
                    .ok_or_else(|| Error::UserNotFound(email.to_string()))
            })
            .await?;

        let user_ref = &user;
        let receipt: DeliveryReceipt = step
            .run("send-welcome-message", move || async move {
                let body = "Hi,\n\nThanks for signing up. We're glad to have you onboard!";
                s.mailer.send(&user_ref.email, "Welcome to the app", body).await
            })
            .await?;

        Ok(json!({
            "success": true,
            "userId": user.id,
            "messageId": receipt.message_id,
        }))
    }
}
