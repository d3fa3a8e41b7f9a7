use std::collections::HashMap;
#[cfg(test)]
use std::sync::{Arc, Mutex};

use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use jobboard_core::template::{MailTemplate, RenderedMail};
use jobboard_util::MailConfig;

#[derive(Debug, Error)]
pub enum MailError {
    #[error("invalid mailbox: {0}")]
    Address(#[from] lettre::address::AddressError),
    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),
    #[error("smtp delivery failed: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
    #[error("template error: {0}")]
    Template(#[from] jobboard_core::template::TemplateError),
}

#[derive(Clone)]
enum Transport {
    Log,
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    #[cfg(test)]
    Memory(Arc<Mutex<Vec<SentMail>>>),
}

/// Message captured by the in-memory transport.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Renders transactional templates and hands them to SMTP or the log.
#[derive(Clone)]
pub struct Mailer {
    from: Mailbox,
    transport: Transport,
}

impl Mailer {
    pub fn from_config(config: &MailConfig) -> Result<Self, MailError> {
        let from: Mailbox = config.from.parse()?;
        let transport = match &config.smtp_host {
            Some(host) => {
                let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
                    .port(config.smtp_port);
                if let (Some(username), Some(password)) =
                    (&config.smtp_username, &config.smtp_password)
                {
                    builder = builder
                        .credentials(Credentials::new(username.clone(), password.clone()));
                }
                info!(stage = "mail", %host, port = config.smtp_port, "smtp delivery enabled");
                Transport::Smtp(builder.build())
            }
            None => Transport::Log,
        };
        Ok(Self { from, transport })
    }

    #[cfg(test)]
    pub fn memory() -> (Self, Arc<Mutex<Vec<SentMail>>>) {
        let outbox = Arc::new(Mutex::new(Vec::new()));
        let mailer = Self {
            from: "Job Board <no-reply@jobboard.local>"
                .parse()
                .expect("static mailbox"),
            transport: Transport::Memory(outbox.clone()),
        };
        (mailer, outbox)
    }

    /// Renders and delivers `template`. Failures are logged and counted, never returned.
    pub async fn send(&self, to: &str, template: MailTemplate, vars: &HashMap<&str, String>) {
        let result = match template.render(vars) {
            Ok(rendered) => self.deliver(to, rendered).await,
            Err(err) => Err(err.into()),
        };

        match result {
            Ok(()) => {
                counter!("mail_sent_total", "template" => template.as_str(), "result" => "sent")
                    .increment(1);
            }
            Err(err) => {
                counter!("mail_sent_total", "template" => template.as_str(), "result" => "failed")
                    .increment(1);
                warn!(
                    stage = "mail",
                    %to,
                    template = template.as_str(),
                    error = %err,
                    "mail delivery failed"
                );
            }
        }
    }

    async fn deliver(&self, to: &str, mail: RenderedMail) -> Result<(), MailError> {
        match &self.transport {
            Transport::Log => {
                info!(
                    stage = "mail",
                    %to,
                    subject = %mail.subject,
                    body = %mail.body,
                    "mail written to log"
                );
                Ok(())
            }
            Transport::Smtp(transport) => {
                let message = Message::builder()
                    .from(self.from.clone())
                    .to(to.parse()?)
                    .subject(mail.subject)
                    .header(ContentType::TEXT_PLAIN)
                    .body(mail.body)?;
                transport.send(message).await?;
                Ok(())
            }
            #[cfg(test)]
            Transport::Memory(outbox) => {
                outbox.lock().expect("outbox poisoned").push(SentMail {
                    to: to.to_string(),
                    subject: mail.subject,
                    body: mail.body,
                });
                Ok(())
            }
        }
    }
}
