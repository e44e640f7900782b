//! Transport connector - scoped SMTP sessions against the mail relay

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Attachment as MimeAttachment, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use mailburst_common::config::EngineConfig;
use mailburst_common::types::{MessagePayload, TransportConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How a send attempt failed
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// Could not connect or authenticate
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// Temporary relay condition worth retrying
    #[error("transient send failure: {0}")]
    Transient(String),

    /// Hard rejection, never retried
    #[error("send rejected: {0}")]
    Permanent(String),
}

/// Seam over the relay session so dispatch logic is testable without a
/// live relay.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, payload: &MessagePayload, recipient: &str) -> Result<(), TransportError>;
}

/// Builds a transport for one job execution.
pub trait TransportFactory: Send + Sync {
    fn create(
        &self,
        transport: &TransportConfig,
        engine: &EngineConfig,
    ) -> mailburst_common::Result<Arc<dyn MailTransport>>;
}

/// Production factory producing [`SmtpConnector`]s.
pub struct SmtpTransportFactory;

impl TransportFactory for SmtpTransportFactory {
    fn create(
        &self,
        transport: &TransportConfig,
        engine: &EngineConfig,
    ) -> mailburst_common::Result<Arc<dyn MailTransport>> {
        let connector = SmtpConnector::new(
            transport.clone(),
            Duration::from_secs(engine.connect_timeout_secs),
            Duration::from_secs(engine.send_timeout_secs),
        )?;
        Ok(Arc::new(connector))
    }
}

/// One live relay session per job execution.
///
/// The session is opened lazily (STARTTLS, then authentication) and reused
/// for consecutive sends. A failure that invalidates the session drops it
/// so the next send reopens; sessions are never shared across jobs or
/// tenants. Dropping the connector releases the session on every exit path.
pub struct SmtpConnector {
    config: TransportConfig,
    from: Mailbox,
    connect_timeout: Duration,
    send_timeout: Duration,
    mailer: Mutex<Option<AsyncSmtpTransport<Tokio1Executor>>>,
}

impl SmtpConnector {
    pub fn new(
        config: TransportConfig,
        connect_timeout: Duration,
        send_timeout: Duration,
    ) -> mailburst_common::Result<Self> {
        config.validate()?;

        let address = config.username.parse().map_err(|e| {
            mailburst_common::Error::Config(format!(
                "sender address {} is not a mailbox: {}",
                config.username, e
            ))
        })?;
        let from = Mailbox::new(config.sender_name.clone(), address);

        Ok(Self {
            config,
            from,
            connect_timeout,
            send_timeout,
            mailer: Mutex::new(None),
        })
    }

    /// Drop the cached session so the next send reconnects.
    pub async fn reset(&self) {
        let mut guard = self.mailer.lock().await;
        if guard.take().is_some() {
            debug!("relay session to {} dropped", self.config.host);
        }
    }

    /// Return the live session, opening one if needed.
    async fn acquire(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, TransportError> {
        let mut guard = self.mailer.lock().await;
        if let Some(mailer) = guard.as_ref() {
            return Ok(mailer.clone());
        }

        let mailer = self.open().await?;
        *guard = Some(mailer.clone());
        Ok(mailer)
    }

    async fn open(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, TransportError> {
        debug!(
            "connecting to relay {}:{} as {}",
            self.config.host, self.config.port, self.config.username
        );

        let mailer = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)
            .map_err(|e| {
                TransportError::Unavailable(format!("failed to create SMTP transport: {}", e))
            })?
            .port(self.config.port)
            .credentials(Credentials::new(
                self.config.username.clone(),
                self.config.credential.clone(),
            ))
            .timeout(Some(self.send_timeout))
            .build();

        let connected = tokio::time::timeout(self.connect_timeout, mailer.test_connection())
            .await
            .map_err(|_| TransportError::Unavailable("connection open timed out".to_string()))?
            .map_err(|e| TransportError::Unavailable(format!("connect/auth failed: {}", e)))?;

        if !connected {
            return Err(TransportError::Unavailable(
                "relay refused the connection test".to_string(),
            ));
        }

        info!("connected to relay {}:{}", self.config.host, self.config.port);
        Ok(mailer)
    }

    /// Build the RFC message for one recipient.
    fn build_email(
        &self,
        payload: &MessagePayload,
        recipient: &str,
    ) -> Result<Message, TransportError> {
        let to: Mailbox = recipient.parse().map_err(|e| {
            TransportError::Permanent(format!("invalid recipient address {}: {}", recipient, e))
        })?;

        let builder = Message::builder()
            .from(self.from.clone())
            .reply_to(Mailbox::new(None, self.from.email.clone()))
            .to(to)
            .subject(&payload.subject)
            .message_id(Some(format!(
                "<{}@{}>",
                Uuid::new_v4(),
                self.config.message_id_domain()
            )));

        let email = if payload.attachments.is_empty() {
            builder
                .header(ContentType::TEXT_HTML)
                .body(payload.body_html.clone())
        } else {
            let mut multipart = MultiPart::mixed().multipart(
                MultiPart::alternative().singlepart(SinglePart::html(payload.body_html.clone())),
            );

            for attachment in &payload.attachments {
                let content_type = ContentType::parse(&attachment.mime_type).map_err(|e| {
                    TransportError::Permanent(format!(
                        "attachment {} has invalid MIME type {}: {}",
                        attachment.filename, attachment.mime_type, e
                    ))
                })?;
                multipart = multipart.singlepart(
                    MimeAttachment::new(attachment.filename.clone())
                        .body(attachment.content.clone(), content_type),
                );
            }

            builder.multipart(multipart)
        };

        email.map_err(|e| TransportError::Permanent(format!("failed to build email: {}", e)))
    }
}

#[async_trait]
impl MailTransport for SmtpConnector {
    async fn send(&self, payload: &MessagePayload, recipient: &str) -> Result<(), TransportError> {
        let email = self.build_email(payload, recipient)?;
        let mailer = self.acquire().await?;

        match tokio::time::timeout(self.send_timeout, mailer.send(email)).await {
            Err(_) => {
                self.reset().await;
                Err(TransportError::Transient(
                    "send attempt timed out".to_string(),
                ))
            }
            Ok(Ok(response)) => {
                debug!("relay accepted send to {}: {:?}", recipient, response.code());
                Ok(())
            }
            Ok(Err(e)) => {
                let classified = classify_send_error(&e.to_string());
                if !matches!(classified, TransportError::Permanent(_)) {
                    // The session state is suspect; reopen before the retry
                    self.reset().await;
                }
                warn!("send to {} failed: {}", recipient, classified);
                Err(classified)
            }
        }
    }
}

/// Map a relay error message onto the retry taxonomy.
fn classify_send_error(error: &str) -> TransportError {
    let lower = error.to_ascii_lowercase();

    if lower.contains("authentication") || lower.contains("credentials") {
        return TransportError::Unavailable(error.to_string());
    }
    if lower.contains("connection refused") || lower.contains("could not connect") {
        return TransportError::Unavailable(error.to_string());
    }

    if error.contains("550")
        || error.contains("551")
        || error.contains("553")
        || error.contains("554")
        || error.contains("5.1.1")
        || lower.contains("user unknown")
        || lower.contains("does not exist")
        || lower.contains("mailbox unavailable")
    {
        return TransportError::Permanent(error.to_string());
    }

    if error.contains("421")
        || error.contains("450")
        || error.contains("451")
        || error.contains("452")
        || lower.contains("temporarily")
        || lower.contains("try again")
        || lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection reset")
        || lower.contains("connection closed")
        || lower.contains("broken pipe")
    {
        return TransportError::Transient(error.to_string());
    }

    // Unknown relay responses get one more chance through the retry path
    TransportError::Transient(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailburst_common::types::Attachment;

    fn config() -> TransportConfig {
        TransportConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: "sender@example.com".to_string(),
            credential: "secret".to_string(),
            sender_name: Some("Sender".to_string()),
            delay_seconds: 5.0,
        }
    }

    fn connector() -> SmtpConnector {
        SmtpConnector::new(config(), Duration::from_secs(30), Duration::from_secs(30))
            .expect("valid config")
    }

    fn payload() -> MessagePayload {
        MessagePayload {
            subject: "Hello".to_string(),
            body_html: "<p>Hi there</p>".to_string(),
            attachments: vec![],
        }
    }

    #[test]
    fn test_rejects_invalid_sender_address() {
        let mut bad = config();
        bad.username = "not an address".to_string();
        assert!(SmtpConnector::new(bad, Duration::from_secs(1), Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_build_email_plain() {
        let email = connector().build_email(&payload(), "user@example.com");
        assert!(email.is_ok());
    }

    #[test]
    fn test_build_email_with_attachment() {
        let mut message = payload();
        message.attachments.push(Attachment {
            filename: "report.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            content: vec![1, 2, 3],
        });
        assert!(connector().build_email(&message, "user@example.com").is_ok());
    }

    #[test]
    fn test_build_email_bad_recipient_is_permanent() {
        let err = connector()
            .build_email(&payload(), "no spaces allowed@@")
            .unwrap_err();
        assert!(matches!(err, TransportError::Permanent(_)));
    }

    #[test]
    fn test_build_email_bad_mime_type_is_permanent() {
        let mut message = payload();
        message.attachments.push(Attachment {
            filename: "x".to_string(),
            mime_type: "not a mime".to_string(),
            content: vec![],
        });
        let err = connector()
            .build_email(&message, "user@example.com")
            .unwrap_err();
        assert!(matches!(err, TransportError::Permanent(_)));
    }

    #[test]
    fn test_classify_permanent() {
        assert!(matches!(
            classify_send_error("550 5.1.1 User unknown"),
            TransportError::Permanent(_)
        ));
        assert!(matches!(
            classify_send_error("recipient does not exist"),
            TransportError::Permanent(_)
        ));
    }

    #[test]
    fn test_classify_transient() {
        assert!(matches!(
            classify_send_error("451 try again later"),
            TransportError::Transient(_)
        ));
        assert!(matches!(
            classify_send_error("connection reset by peer"),
            TransportError::Transient(_)
        ));
        // Unknown errors stay retryable
        assert!(matches!(
            classify_send_error("something odd"),
            TransportError::Transient(_)
        ));
    }

    #[test]
    fn test_classify_unavailable() {
        assert!(matches!(
            classify_send_error("authentication failed"),
            TransportError::Unavailable(_)
        ));
        assert!(matches!(
            classify_send_error("connection refused"),
            TransportError::Unavailable(_)
        ));
    }
}
