use super::ent;
use super::error::AlarmError;
use crate::config::AlarmConfig;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use serde::Serialize;

#[derive(Serialize)]
struct EmailBody<'a> {
    update_time: String,
    changes: &'a [ent::StatusChange],
}

/// Emails a notice when devices drop offline.
#[derive(Clone)]
pub struct Alarm {
    from: Mailbox,
    to: Mailbox,
    mailer: SmtpTransport,
}

impl Alarm {
    pub fn new(config: &AlarmConfig) -> Result<Alarm, AlarmError> {
        let creds = Credentials::new(config.smtp_username.clone(), config.smtp_password.clone());
        Ok(Alarm {
            from: config.from.parse()?,
            to: config.to.parse()?,
            mailer: SmtpTransport::starttls_relay(&config.domain)?
                .port(config.port)
                .credentials(creds)
                .build(),
        })
    }

    pub fn compose(&self, changes: &[ent::StatusChange]) -> Result<Message, AlarmError> {
        let body = render_body(changes, Utc::now())?;
        Ok(Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(subject(changes))
            .header(ContentType::TEXT_PLAIN)
            .body(body)?)
    }

    pub async fn notify(&self, changes: Vec<ent::StatusChange>) {
        let email = match self.compose(&changes) {
            Ok(email) => email,
            Err(e) => {
                tracing::error!("Could not compose alarm: {e}");
                return;
            }
        };
        let mailer = self.mailer.clone();
        // SmtpTransport blocks
        match tokio::task::spawn_blocking(move || mailer.send(&email)).await {
            Ok(Ok(_)) => tracing::info!(count = changes.len(), "Alarm email sent"),
            Ok(Err(e)) => {
                tracing::error!("Could not send email: {e:?}");
                tracing::info!("Unsent alarm: {:?}", changes);
            }
            Err(e) => tracing::error!("Alarm task failed: {e}"),
        }
    }
}

fn subject(changes: &[ent::StatusChange]) -> String {
    match changes {
        [single] => format!(
            "Device offline: {}",
            single.hostname.as_deref().unwrap_or(&single.ip_address)
        ),
        _ => format!("{} devices offline", changes.len()),
    }
}

fn render_body(changes: &[ent::StatusChange], now: DateTime<Utc>) -> Result<String, AlarmError> {
    let body = EmailBody {
        update_time: now.to_rfc3339(),
        changes,
    };
    Ok(serde_json::to_string_pretty(&body)?)
}
