//! Users, moderators and admins
//!
//! The workflows only read users. Accounts are created through the CLI.

mod sqlite;

pub use sqlite::SqliteUserStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assignment::SkillPattern;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Moderator,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Moderator => "moderator",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Role::User),
            "moderator" => Some(Role::Moderator),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub email: String,
    pub role: Role,
    pub skills: Vec<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub role: Role,
    pub skills: Vec<String>,
}

impl NewUser {
    pub fn new(email: impl Into<String>, role: Role) -> Self {
        Self {
            email: email.into(),
            role,
            skills: Vec::new(),
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }
}

/// User lookups needed by assignment and notification.
///
/// Every "first" lookup orders by `(created_at, id)` ascending so that ties
/// between equally qualified users resolve the same way on every run.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create(&self, user: &NewUser) -> Result<User>;

    async fn find_by_id(&self, id: &str) -> Result<Option<User>>;

    async fn find_by_email(&self, email: &str) -> Result<Option<User>>;

    async fn list(&self) -> Result<Vec<User>>;

    /// Change a user's role and/or skills; `None` leaves the field as it is
    async fn update_user(
        &self,
        email: &str,
        role: Option<Role>,
        skills: Option<Vec<String>>,
    ) -> Result<User>;

    /// First moderator holding at least one skill the pattern accepts
    async fn find_moderator_by_skill_pattern(&self, pattern: &SkillPattern) -> Result<Option<User>>;

    async fn find_first_admin(&self) -> Result<Option<User>>;
}
