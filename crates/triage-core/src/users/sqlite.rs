//! SQLite implementation of the UserStore

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{FromRow, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use super::{NewUser, Role, User, UserStore};
use crate::assignment::SkillPattern;
use crate::error::{Error, Result};
use crate::storage::parse_timestamp;

#[derive(Clone)]
pub struct SqliteUserStore {
    pool: SqlitePool,
}

impl SqliteUserStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn users_with_role(&self, role: Role) -> Result<Vec<User>> {
        let rows: Vec<UserRow> =
            sqlx::query_as("SELECT * FROM users WHERE role = ? ORDER BY created_at, id")
                .bind(role.as_str())
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter().map(|r| r.into_user()).collect()
    }
}

#[async_trait]
impl UserStore for SqliteUserStore {
    async fn create(&self, user: &NewUser) -> Result<User> {
        let email = user.email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(Error::InvalidInput(format!(
                "'{}' is not a valid email address",
                user.email
            )));
        }

        let skills = clean_skills(&user.skills);

        let id = Uuid::new_v4().to_string();
        sqlx::query(
            "INSERT INTO users (id, email, role, skills, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(email)
        .bind(user.role.as_str())
        .bind(serde_json::to_string(&skills)?)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                Error::InvalidInput(format!("A user with email '{}' already exists", email))
            }
            other => Error::DatabaseError(other),
        })?;

        debug!(user_id = %id, role = %user.role, "User created");

        self.find_by_id(&id)
            .await?
            .ok_or_else(|| Error::UserNotFound(id))
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<User>> {
        let row: Option<UserRow> = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| r.into_user()).transpose()
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<User>> {
        let row: Option<UserRow> =
            sqlx::query_as("SELECT * FROM users WHERE email = ? COLLATE NOCASE")
                .bind(email.trim())
                .fetch_optional(&self.pool)
                .await?;

        row.map(|r| r.into_user()).transpose()
    }

    async fn list(&self) -> Result<Vec<User>> {
        let rows: Vec<UserRow> = sqlx::query_as("SELECT * FROM users ORDER BY created_at, id")
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(|r| r.into_user()).collect()
    }

    async fn update_user(
        &self,
        email: &str,
        role: Option<Role>,
        skills: Option<Vec<String>>,
    ) -> Result<User> {
        let existing = self
            .find_by_email(email)
            .await?
            .ok_or_else(|| Error::UserNotFound(email.trim().to_string()))?;

        let role = role.unwrap_or(existing.role);
        let skills = match skills {
            Some(skills) => clean_skills(&skills),
            None => existing.skills,
        };

        let result = sqlx::query("UPDATE users SET role = ?, skills = ? WHERE id = ?")
            .bind(role.as_str())
            .bind(serde_json::to_string(&skills)?)
            .bind(&existing.id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Error::UserNotFound(existing.id));
        }

        debug!(user_id = %existing.id, role = %role, "User updated");

        self.find_by_id(&existing.id)
            .await?
            .ok_or_else(|| Error::UserNotFound(existing.id))
    }

    async fn find_moderator_by_skill_pattern(&self, pattern: &SkillPattern) -> Result<Option<User>> {
        // Skills are a JSON list per row, so matching happens here rather than in SQL
        let moderators = self.users_with_role(Role::Moderator).await?;
        Ok(moderators
            .into_iter()
            .find(|m| pattern.matches_any(&m.skills)))
    }

    async fn find_first_admin(&self) -> Result<Option<User>> {
        Ok(self.users_with_role(Role::Admin).await?.into_iter().next())
    }
}

fn clean_skills(skills: &[String]) -> Vec<String> {
    skills
        .iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, FromRow)]
struct UserRow {
    id: String,
    email: String,
    role: String,
    skills: String,
    created_at: String,
}

impl UserRow {
    fn into_user(self) -> Result<User> {
        let role = Role::parse(&self.role)
            .ok_or_else(|| Error::Other(format!("Invalid user role: {}", self.role)))?;

        Ok(User {
            id: self.id,
            email: self.email,
            role,
            skills: serde_json::from_str(&self.skills)?,
            created_at: parse_timestamp(&self.created_at),
        })
    }
}
