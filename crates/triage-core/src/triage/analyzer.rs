//! Retrieval-augmented ticket analysis

use std::fmt::Write as _;
use std::sync::Arc;

use tracing::{debug, info};

use super::judgement::{Judgement, parse_judgement};
use crate::error::Result;
use crate::knowledge::SimilarTicket;
use crate::llm::InferenceBackend;
use crate::tickets::Ticket;

const SYSTEM_PROMPT: &str = "You are an AI assistant that processes technical support tickets.

Your job is to:
1. Summarize the issue.
2. Estimate its priority.
3. Provide helpful notes and resource links for human moderators.
4. List the technical skills required to solve it.

Respond with only a raw JSON object. Do not use markdown or code fences.";

/// Builds the prompt for a ticket, calls the model and validates the answer
#[derive(Clone)]
pub struct TriageAnalyzer {
    backend: Arc<dyn InferenceBackend>,
}

impl TriageAnalyzer {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self { backend }
    }

    /// User prompt for `ticket`, grounded on previously resolved tickets
    pub fn build_prompt(&self, ticket: &Ticket, similar: &[SimilarTicket]) -> String {
        let mut prompt = String::from(
            "Analyze the following support ticket and return a JSON object with:\n\n\
             - summary: A short 1-2 sentence summary of the issue.\n\
             - priority: One of \"low\", \"medium\", or \"high\".\n\
             - helpfulNotes: A technical explanation a moderator can use to solve the issue, \
             with useful links where possible.\n\
             - relatedSkills: An array of skills required to solve the issue \
             (e.g. [\"React\", \"MongoDB\"]).\n\n\
             Example:\n\
             {\"summary\": \"...\", \"priority\": \"high\", \"helpfulNotes\": \"...\", \
             \"relatedSkills\": [\"React\", \"Node.js\"]}\n\n---\n\n",
        );

        if !similar.is_empty() {
            prompt.push_str("Similar tickets resolved in the past:\n\n");
            for (i, s) in similar.iter().enumerate() {
                let _ = writeln!(
                    prompt,
                    "{}. {} (similarity {:.2})\n   Resolution: {}",
                    i + 1,
                    s.title,
                    s.score,
                    s.resolution
                );
            }
            prompt.push_str("\nUse them where they apply.\n\n---\n\n");
        }

        let _ = write!(
            prompt,
            "Ticket information:\n\n- Title: {}\n- Description: {}",
            ticket.title, ticket.description
        );
        prompt
    }

    pub async fn analyze(&self, ticket: &Ticket, similar: &[SimilarTicket]) -> Result<Judgement> {
        let prompt = self.build_prompt(ticket, similar);
        debug!(ticket_id = %ticket.id, context = similar.len(), "Requesting ticket analysis");

        let raw = self.backend.infer(SYSTEM_PROMPT, &prompt).await?;
        let judgement = parse_judgement(&raw)?;

        info!(
            ticket_id = %ticket.id,
            priority = %judgement.priority,
            skills = judgement.related_skills.len(),
            "Ticket analyzed"
        );
        Ok(judgement)
    }
}
