use std::time::Duration;

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Attachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::{
    config::{AppConfig, SmtpSettings},
    error::AppError,
    services::retry::{linear_backoff, retry_with_backoff},
};

#[derive(Debug, Clone)]
pub struct EmailAttachment {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: Option<String>,
    pub attachments: Vec<EmailAttachment>,
    /// Blind-copy the configured administrative address.
    pub admin_copy: bool,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), String>;
}

pub struct SmtpMailer {
    settings: SmtpSettings,
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpMailer {
    pub fn new(settings: SmtpSettings) -> Result<Self, AppError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&settings.host)
            .map_err(|error| {
                AppError::Internal(format!("Failed to create SMTP relay: {error}"))
            })?
            .port(settings.port);
        if let (Some(user), Some(password)) = (&settings.user, &settings.password) {
            builder = builder.credentials(Credentials::new(user.clone(), password.clone()));
        }
        Ok(Self {
            transport: builder.build(),
            settings,
        })
    }

    fn build_message(&self, email: &EmailMessage) -> Result<Message, String> {
        let from: Mailbox = self
            .settings
            .from_address
            .parse()
            .map_err(|error| format!("Invalid from address: {error}"))?;
        let to: Mailbox = email
            .to
            .parse()
            .map_err(|error| format!("Invalid recipient '{}': {error}", email.to))?;

        let mut builder = Message::builder().from(from).to(to).subject(&email.subject);
        if email.admin_copy {
            if let Some(admin) = self.settings.admin_copy.as_deref() {
                match admin.parse::<Mailbox>() {
                    Ok(mailbox) => builder = builder.bcc(mailbox),
                    Err(error) => {
                        tracing::warn!(admin, error = %error, "Ignoring invalid admin copy address")
                    }
                }
            }
        }

        let body = match &email.text {
            Some(text) => MultiPart::alternative()
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_PLAIN)
                        .body(text.clone()),
                )
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_HTML)
                        .body(email.html.clone()),
                ),
            None => MultiPart::alternative().singlepart(
                SinglePart::builder()
                    .header(ContentType::TEXT_HTML)
                    .body(email.html.clone()),
            ),
        };

        let mut mixed = MultiPart::mixed().multipart(body);
        for attachment in &email.attachments {
            let content_type = ContentType::parse(&attachment.content_type)
                .map_err(|error| format!("Invalid attachment content type: {error}"))?;
            mixed = mixed.singlepart(
                Attachment::new(attachment.file_name.clone())
                    .body(attachment.bytes.clone(), content_type),
            );
        }

        builder
            .multipart(mixed)
            .map_err(|error| format!("Failed to build message: {error}"))
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, message: &EmailMessage) -> Result<(), String> {
        let built = self.build_message(message)?;
        self.transport
            .send(built)
            .await
            .map_err(|error| format!("SMTP send failed: {error}"))?;
        tracing::info!(to = %message.to, subject = %message.subject, "Email sent");
        Ok(())
    }
}

/// Sends with the configured bounded retry and linear backoff.
pub async fn send_with_retry(
    mailer: &dyn Mailer,
    config: &AppConfig,
    message: &EmailMessage,
) -> Result<(), AppError> {
    retry_with_backoff(
        "send_email",
        config.email_max_attempts,
        linear_backoff(Duration::from_millis(config.email_retry_base_ms)),
        |_| mailer.send(message),
    )
    .await
    .map_err(|error| {
        tracing::error!(to = %message.to, error = %error, "Email delivery failed");
        AppError::Dependency("Email delivery failed.".to_string())
    })
}

#[cfg(test)]
pub mod mock {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::{EmailMessage, Mailer};

    /// Fails the first `failures` sends, then records every message.
    #[derive(Default)]
    pub struct MockMailer {
        pub failures: u32,
        pub calls: AtomicU32,
        pub sent: Mutex<Vec<EmailMessage>>,
    }

    #[async_trait]
    impl Mailer for MockMailer {
        async fn send(&self, message: &EmailMessage) -> Result<(), String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(format!("transient failure {call}"));
            }
            self.sent.lock().expect("mailer lock").push(message.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::{mock::MockMailer, send_with_retry, EmailMessage};
    use crate::config::AppConfig;

    fn message() -> EmailMessage {
        EmailMessage {
            to: "ana@example.com".to_string(),
            subject: "Inspection".to_string(),
            html: "<p>hi</p>".to_string(),
            ..EmailMessage::default()
        }
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let mailer = MockMailer {
            failures: 2,
            ..MockMailer::default()
        };
        let config = AppConfig::for_tests();
        send_with_retry(&mailer, &config, &message())
            .await
            .expect("third attempt succeeds");
        assert_eq!(mailer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(mailer.sent.lock().expect("lock").len(), 1);
    }

    #[tokio::test]
    async fn gives_up_after_configured_attempts() {
        let mailer = MockMailer {
            failures: 10,
            ..MockMailer::default()
        };
        let config = AppConfig::for_tests();
        let result = send_with_retry(&mailer, &config, &message()).await;
        assert!(result.is_err());
        assert_eq!(mailer.calls.load(Ordering::SeqCst), config.email_max_attempts);
    }
}
