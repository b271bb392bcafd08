//! Outbound mail capability
//!
//! Transport is someone else's problem. The workflows only need to hand a
//! message to a [`Mailer`] and learn whether it was accepted.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Acknowledgement returned by a mailer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub accepted: Vec<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<DeliveryReceipt>;
}

/// Mailer that writes each message to the tracing log instead of a transport
#[derive(Debug, Clone)]
pub struct TracingMailer {
    from: String,
}

impl TracingMailer {
    pub fn new(from: impl Into<String>) -> Self {
        Self { from: from.into() }
    }
}

impl Default for TracingMailer {
    fn default() -> Self {
        Self::new("NOREPLY Triage")
    }
}

#[async_trait]
impl Mailer for TracingMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<DeliveryReceipt> {
        if to.trim().is_empty() {
            return Err(Error::MailFailed {
                to: to.to_string(),
                reason: "no recipient".to_string(),
            });
        }

        let message_id = format!("<{}@triage>", Uuid::new_v4());
        info!(
            from = %self.from,
            to = %to,
            subject = %subject,
            message_id = %message_id,
            body_len = body.len(),
            "Mail sent"
        );

        Ok(DeliveryReceipt {
            message_id,
            accepted: vec![to.to_string()],
        })
    }
}
