//! Mail delivery for the worker process.

use async_trait::async_trait;
use tracing::info;

use hearth_core::{Email, Error, Mailer, Result};

/// Mailer that writes each message to the log instead of a mail relay.
/// Deployments with a relay register their own [`Mailer`].
#[derive(Debug, Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &Email) -> Result<()> {
        if email.to.is_empty() {
            return Err(Error::InvalidInput("email has no recipient".into()));
        }
        info!(
            subsystem = "server",
            component = "mailer",
            to = %email.to,
            subject = %email.subject,
            body_len = email.body.len(),
            "Email delivered to log"
        );
        Ok(())
    }
}
