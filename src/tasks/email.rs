use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    Address, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tera::Tera;
use tracing::{info, instrument};

use super::worker::TaskHandler;
use super::TaskEnvelope;
use crate::config::{EmailConfig, EmailProvider};

pub const TYPE_EMAIL_SEND: &str = "email:send";

pub const TEMPLATE_PASSWORD_RESET: &str = "password-reset";
pub const TEMPLATE_EMAIL_VERIFICATION: &str = "email-verification";
pub const TEMPLATE_ACCOUNT_DELETION: &str = "account-deletion-scheduled";

/// Payload of an `email:send` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailPayload {
    pub to: String,
    pub subject: String,
    pub template: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl EmailPayload {
    pub fn new(to: impl Into<String>, subject: impl Into<String>, template: &str) -> Self {
        Self {
            to: to.into(),
            subject: subject.into(),
            template: template.to_string(),
            data: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }
}

/// A rendered message ready for a sender.
#[derive(Debug, Clone)]
pub struct OutgoingEmail {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, email: &OutgoingEmail) -> anyhow::Result<()>;
}

/// Port on which SMTP servers expect TLS from the first byte.
const SMTPS_PORT: u16 = 465;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmtpSecurity {
    /// Plain SMTP, for local catchers such as MailHog.
    None,
    /// Upgrade with STARTTLS (submission port 587).
    StartTls,
    /// Implicit TLS (port 465).
    Tls,
}

fn smtp_security(cfg: &EmailConfig) -> SmtpSecurity {
    match (&cfg.smtp_username, &cfg.smtp_password) {
        (Some(_), Some(_)) if cfg.smtp_port == SMTPS_PORT => SmtpSecurity::Tls,
        (Some(_), Some(_)) => SmtpSecurity::StartTls,
        _ => SmtpSecurity::None,
    }
}

pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpSender {
    /// Authenticated relays use implicit TLS on 465 and STARTTLS on any other
    /// port. Without credentials the connection is plain SMTP.
    pub fn new(cfg: &EmailConfig) -> anyhow::Result<Self> {
        let builder = match smtp_security(cfg) {
            SmtpSecurity::Tls => AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.smtp_host)
                .context("create smtp relay")?,
            SmtpSecurity::StartTls => {
                AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_host)
                    .context("create smtp starttls relay")?
            }
            SmtpSecurity::None => {
                AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.smtp_host)
            }
        };
        let builder = builder.port(cfg.smtp_port);
        let transport = match (&cfg.smtp_username, &cfg.smtp_password) {
            (Some(user), Some(pass)) => builder
                .credentials(Credentials::new(user.clone(), pass.clone()))
                .build(),
            _ => builder.build(),
        };
        let address: Address = cfg.from_address.parse().context("invalid EMAIL_FROM")?;
        Ok(Self {
            transport,
            from: Mailbox::new(Some(cfg.from_name.clone()), address),
        })
    }
}

#[async_trait]
impl EmailSender for SmtpSender {
    async fn send(&self, email: &OutgoingEmail) -> anyhow::Result<()> {
        let to: Mailbox = email.to.parse().context("invalid recipient address")?;
        let message = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(email.subject.clone())
            .header(ContentType::TEXT_HTML)
            .body(email.html.clone())
            .context("build email")?;
        self.transport.send(message).await.context("smtp send")?;
        Ok(())
    }
}

/// Logs instead of sending. Only recipient and subject are logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSender;

#[async_trait]
impl EmailSender for LogSender {
    async fn send(&self, email: &OutgoingEmail) -> anyhow::Result<()> {
        info!(to = %email.to, subject = %email.subject, bytes = email.html.len(), "email (log provider)");
        Ok(())
    }
}

pub fn sender_from_config(cfg: &EmailConfig) -> anyhow::Result<Arc<dyn EmailSender>> {
    Ok(match cfg.provider {
        EmailProvider::Smtp => Arc::new(SmtpSender::new(cfg)?),
        EmailProvider::Log => Arc::new(LogSender),
    })
}

/// Named HTML templates, autoescaped.
pub struct EmailTemplates {
    tera: Tera,
}

impl EmailTemplates {
    pub fn new() -> anyhow::Result<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (
                "password-reset.html",
                include_str!("../../templates/emails/password-reset.html"),
            ),
            (
                "email-verification.html",
                include_str!("../../templates/emails/email-verification.html"),
            ),
            (
                "account-deletion-scheduled.html",
                include_str!("../../templates/emails/account-deletion-scheduled.html"),
            ),
        ])
        .context("parse email templates")?;
        Ok(Self { tera })
    }

    pub fn render(&self, name: &str, data: &Map<String, Value>) -> anyhow::Result<String> {
        let context = tera::Context::from_serialize(data).context("build template context")?;
        self.tera
            .render(&format!("{name}.html"), &context)
            .with_context(|| format!("render email template {name}"))
    }
}

/// Handler for `email:send`: render, then send.
pub struct EmailTask {
    templates: EmailTemplates,
    sender: Arc<dyn EmailSender>,
}

impl EmailTask {
    pub fn new(templates: EmailTemplates, sender: Arc<dyn EmailSender>) -> Self {
        Self { templates, sender }
    }
}

#[async_trait]
impl TaskHandler for EmailTask {
    #[instrument(skip_all, fields(job_id = %envelope.metadata.job_id))]
    async fn handle(&self, envelope: &TaskEnvelope) -> anyhow::Result<()> {
        let payload: EmailPayload = envelope.decode_payload()?;
        let html = self.templates.render(&payload.template, &payload.data)?;
        self.sender
            .send(&OutgoingEmail {
                to: payload.to,
                subject: payload.subject,
                html,
            })
            .await?;
        info!(template = %payload.template, "email sent");
        Ok(())
    }
}
