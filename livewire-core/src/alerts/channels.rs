use super::notifications::{Notification, NotificationKind};
use crate::error::{LivewireError, Result};
use askama::Template;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// An outbound transport for alert notifications.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, notification: &Notification) -> Result<()>;
}

/// JSON body POSTed by [`WebhookChannel`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WebhookPayload {
    pub alert_id: String,
    pub severity: String,
    pub rule_name: String,
    pub metric: String,
    pub threshold: f64,
    pub current_value: f64,
    pub triggered_at: DateTime<Utc>,
    pub message: String,
}

impl From<&Notification> for WebhookPayload {
    fn from(notification: &Notification) -> Self {
        let alert = &notification.alert;
        let message = match notification.kind {
            NotificationKind::Triggered => alert.message.clone(),
            NotificationKind::Escalated => format!("ESCALATED: {}", alert.message),
            NotificationKind::Resolved => format!("RESOLVED: {}", alert.message),
        };
        Self {
            alert_id: alert.id.clone(),
            severity: notification.severity.to_string(),
            rule_name: alert.rule_name.clone(),
            metric: alert.metric.clone(),
            threshold: alert.threshold,
            current_value: alert.current_value,
            triggered_at: alert.created_at,
            message,
        }
    }
}

#[cfg(feature = "webhook")]
pub struct WebhookChannel {
    name: String,
    url: String,
    client: reqwest::Client,
}

#[cfg(feature = "webhook")]
impl WebhookChannel {
    pub fn new(name: &str, url: &str, timeout: std::time::Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LivewireError::transport(name, e.to_string()))?;
        Ok(Self {
            name: name.to_string(),
            url: url.to_string(),
            client,
        })
    }
}

#[cfg(feature = "webhook")]
#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let payload = WebhookPayload::from(notification);
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| LivewireError::transport(&self.name, e.to_string()))?;

        if !response.status().is_success() {
            return Err(LivewireError::transport(
                &self.name,
                format!("webhook returned {}", response.status()),
            ));
        }
        Ok(())
    }
}

#[derive(Template)]
#[template(path = "alert_email.html")]
struct AlertEmailTemplate<'a> {
    subject: &'a str,
    accent: &'a str,
    severity: &'a str,
    status: &'a str,
    rule_name: &'a str,
    message: &'a str,
    metric: &'a str,
    current_value: String,
    threshold: String,
    triggered_at: String,
    resolved_at: Option<String>,
    alert_id: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub html_body: String,
}

/// Hands a rendered email to whatever actually delivers mail.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, email: &EmailMessage) -> Result<()>;
}

pub struct EmailChannel {
    name: String,
    from: String,
    recipients: Vec<String>,
    transport: Arc<dyn MailTransport>,
}

impl EmailChannel {
    pub fn new(
        name: &str,
        from: &str,
        recipients: Vec<String>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            name: name.to_string(),
            from: from.to_string(),
            recipients,
            transport,
        }
    }

    pub fn render(&self, notification: &Notification) -> Result<EmailMessage> {
        let alert = &notification.alert;
        let severity = notification.severity.as_str().to_uppercase();
        let status = match notification.kind {
            NotificationKind::Triggered => "triggered",
            NotificationKind::Escalated => "escalated",
            NotificationKind::Resolved => "resolved",
        };
        let subject = format!("[{}] {} ({})", severity, alert.rule_name, status);
        let accent = match notification.severity {
            super::AlertSeverity::Low => "#3f83f8",
            super::AlertSeverity::Medium => "#f0b429",
            super::AlertSeverity::High => "#f35627",
            super::AlertSeverity::Critical => "#d64545",
        };

        let template = AlertEmailTemplate {
            subject: &subject,
            accent,
            severity: &severity,
            status,
            rule_name: &alert.rule_name,
            message: &alert.message,
            metric: &alert.metric,
            current_value: format!("{:.2}", alert.current_value),
            threshold: format!("{:.2}", alert.threshold),
            triggered_at: alert.created_at.to_rfc3339(),
            resolved_at: alert.resolved_at.map(|t| t.to_rfc3339()),
            alert_id: &alert.id,
        };
        let html_body = template
            .render()
            .map_err(|e| LivewireError::internal(format!("email template failed: {}", e)))?;

        Ok(EmailMessage {
            from: self.from.clone(),
            to: self.recipients.clone(),
            subject,
            html_body,
        })
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        if self.recipients.is_empty() {
            return Err(LivewireError::transport(&self.name, "no recipients configured"));
        }
        let email = self.render(notification)?;
        self.transport
            .deliver(&email)
            .await
            .map_err(|e| match e {
                LivewireError::TransportFailure { .. } => e,
                other => LivewireError::transport(&self.name, other.to_string()),
            })
    }
}

#[cfg(feature = "smtp")]
pub use smtp::SmtpMailer;

#[cfg(feature = "smtp")]
mod smtp {
    use super::{EmailMessage, MailTransport};
    use crate::error::{LivewireError, Result};
    use async_trait::async_trait;
    use lettre::message::header::ContentType;
    use lettre::transport::smtp::authentication::Credentials;
    use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

    pub struct SmtpMailer {
        transport: AsyncSmtpTransport<Tokio1Executor>,
    }

    impl SmtpMailer {
        pub fn new(host: &str, port: u16, username: &str, password: &str) -> Result<Self> {
            let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(host)
                .map_err(|e| LivewireError::transport("smtp", e.to_string()))?
                .port(port)
                .credentials(Credentials::new(username.to_string(), password.to_string()))
                .build();
            Ok(Self { transport })
        }
    }

    #[async_trait]
    impl MailTransport for SmtpMailer {
        async fn deliver(&self, email: &EmailMessage) -> Result<()> {
            let invalid = |e: lettre::address::AddressError| LivewireError::transport("smtp", e.to_string());
            let mut builder = Message::builder()
                .from(email.from.parse().map_err(invalid)?)
                .subject(email.subject.clone());
            for to in &email.to {
                builder = builder.to(to.parse().map_err(invalid)?);
            }
            let message = builder
                .header(ContentType::TEXT_HTML)
                .body(email.html_body.clone())
                .map_err(|e| LivewireError::transport("smtp", e.to_string()))?;

            self.transport
                .send(message)
                .await
                .map_err(|e| LivewireError::transport("smtp", e.to_string()))?;
            Ok(())
        }
    }
}

/// Writes notifications to the tracing log.
#[derive(Debug, Default)]
pub struct LogChannel;

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, notification: &Notification) -> Result<()> {
        let alert = &notification.alert;
        tracing::warn!(
            alert_id = %alert.id,
            rule_id = %alert.rule_id,
            severity = %notification.severity,
            kind = ?notification.kind,
            value = alert.current_value,
            "{}",
            alert.message
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{Alert, AlertCondition, AlertRule, AlertSeverity, MetricRef};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct CapturingTransport {
        sent: Mutex<Vec<EmailMessage>>,
    }

    #[async_trait]
    impl MailTransport for CapturingTransport {
        async fn deliver(&self, email: &EmailMessage) -> Result<()> {
            self.sent.lock().await.push(email.clone());
            Ok(())
        }
    }

    fn notification(kind: NotificationKind) -> Notification {
        let rule = AlertRule::new(
            "cpu",
            "CPU <Hot>",
            MetricRef::new("system", "cpu"),
            AlertCondition::above(85.0),
        )
        .severity(AlertSeverity::High);
        let alert = Alert::open(&rule, 91.234, Utc::now());
        Notification {
            severity: rule.severity,
            alert,
            kind,
            channels: vec!["email".into()],
        }
    }

    #[test]
    fn webhook_payload_fields() {
        let payload = WebhookPayload::from(&notification(NotificationKind::Triggered));
        let json = serde_json::to_value(&payload).unwrap();
        for field in [
            "alert_id",
            "severity",
            "rule_name",
            "metric",
            "threshold",
            "current_value",
            "triggered_at",
            "message",
        ] {
            assert!(json.get(field).is_some(), "missing {}", field);
        }
        assert_eq!(json["severity"], "high");
        assert_eq!(json["metric"], "system.cpu");
    }

    #[tokio::test]
    async fn email_renders_and_escapes() {
        let transport = Arc::new(CapturingTransport::default());
        let channel = EmailChannel::new(
            "email",
            "alerts@example.com",
            vec!["ops@example.com".into()],
            transport.clone(),
        );
        channel
            .send(&notification(NotificationKind::Triggered))
            .await
            .unwrap();

        let sent = transport.sent.lock().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "[HIGH] CPU <Hot> (triggered)");
        assert!(sent[0].html_body.contains("91.23"));
        assert!(sent[0].html_body.contains("CPU &lt;Hot&gt;"));
    }

    #[tokio::test]
    async fn email_without_recipients_fails() {
        let channel = EmailChannel::new(
            "email",
            "alerts@example.com",
            Vec::new(),
            Arc::new(CapturingTransport::default()),
        );
        let err = channel
            .send(&notification(NotificationKind::Resolved))
            .await
            .unwrap_err();
        assert!(matches!(err, LivewireError::TransportFailure { .. }));
    }
}
