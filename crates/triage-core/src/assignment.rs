//! Skill-based ticket assignment
//!
//! A ticket goes to the first moderator who covers any of its required
//! skills, then to the first admin, then to nobody.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::Result;
use crate::users::{User, UserStore};

/// Case-insensitive substring matcher over required skills.
///
/// A moderator skill matches when it contains a required skill, so the
/// required skill "Java" is covered by a moderator listing "JavaScript".
/// This fuzziness is intentional: free-text skill lists rarely agree on exact
/// spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkillPattern {
    needles: Vec<String>,
}

impl SkillPattern {
    pub fn new<I, S>(skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut needles: Vec<String> = Vec::new();
        for skill in skills {
            let needle = skill.as_ref().trim().to_lowercase();
            if !needle.is_empty() && !needles.contains(&needle) {
                needles.push(needle);
            }
        }
        Self { needles }
    }

    pub fn is_empty(&self) -> bool {
        self.needles.is_empty()
    }

    pub fn matches(&self, skill: &str) -> bool {
        let haystack = skill.to_lowercase();
        self.needles.iter().any(|n| haystack.contains(n.as_str()))
    }

    pub fn matches_any(&self, skills: &[String]) -> bool {
        skills.iter().any(|s| self.matches(s))
    }
}

/// Resolves the assignee for a set of required skills
#[derive(Clone)]
pub struct AssignmentResolver {
    users: Arc<dyn UserStore>,
}

impl AssignmentResolver {
    pub fn new(users: Arc<dyn UserStore>) -> Self {
        Self { users }
    }

    pub async fn resolve(&self, related_skills: &[String]) -> Result<Option<User>> {
        let pattern = SkillPattern::new(related_skills);

        if !pattern.is_empty() {
            if let Some(moderator) = self.users.find_moderator_by_skill_pattern(&pattern).await? {
                info!(user_id = %moderator.id, "Assigning ticket to skilled moderator");
                return Ok(Some(moderator));
            }
            debug!(skills = ?related_skills, "No moderator matches the required skills");
        }

        if let Some(admin) = self.users.find_first_admin().await? {
            info!(user_id = %admin.id, "Falling back to admin assignment");
            return Ok(Some(admin));
        }

        info!("No moderator or admin available, ticket left unassigned");
        Ok(None)
    }
}
