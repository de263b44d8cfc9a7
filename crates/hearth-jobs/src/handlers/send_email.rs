//! Outbound email delivery.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use hearth_core::{Email, Error, JobKind, Mailer, SendEmailArgs};

use crate::handler::{JobContext, JobHandler, JobResult, TransactionScope};

/// Handler for [`JobKind::SendEmail`].
pub struct SendEmailHandler {
    mailer: Arc<dyn Mailer>,
}

impl SendEmailHandler {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl JobHandler for SendEmailHandler {
    fn kind(&self) -> JobKind {
        JobKind::SendEmail
    }

    fn transaction_scope(&self) -> TransactionScope {
        TransactionScope::Handler
    }

    async fn execute(&self, ctx: JobContext) -> JobResult {
        let args: SendEmailArgs = match ctx.args() {
            Ok(args) => args,
            Err(e) => return e.into(),
        };
        if !args.to.contains('@') {
            return Error::InvalidInput(format!("invalid recipient address: {:?}", args.to)).into();
        }

        let email = Email {
            to: args.to,
            subject: args.subject,
            body: args.body,
        };
        if let Err(e) = self.mailer.send(&email).await {
            return e.into();
        }

        info!(
            subsystem = "jobs",
            component = "mailer",
            job_id = %ctx.job_id(),
            subject = %email.subject,
            "Email sent"
        );
        JobResult::Success(None)
    }
}
