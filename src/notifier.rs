// ✉️ Notifier - one email per matched (alert, listing) pair
//
// Composes the fixed listing template and hands it to an `EmailSender`.
// Failures are logged here with recipient, vehicle and alert id, and returned
// to the caller, which only counts them.

use crate::entities::{Alert, ListingEvent};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_FROM_ADDRESS: &str = "support@kenny-u-watch.com";
pub const DEFAULT_MAIL_API_URL: &str = "https://api.resend.com/emails";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEmail {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum NotificationError {
    #[error("failed to deliver listing notification to {recipient}")]
    Delivery {
        recipient: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("listing notification to {recipient} timed out after {timeout:?}")]
    TimedOut { recipient: String, timeout: Duration },
}

// ============================================================================
// SENDERS
// ============================================================================

pub trait EmailSender: std::fmt::Debug + Send + Sync + 'static {
    fn send<'s>(
        &'s self,
        email: NotificationEmail,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send + 's;
}

/// Sends through a Resend-compatible HTTP mail API.
pub struct ResendSender {
    api_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for ResendSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResendSender")
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct SendEmailRequest<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    text: &'a str,
}

impl ResendSender {
    async fn send(&self, email: NotificationEmail) -> anyhow::Result<()> {
        let request = SendEmailRequest {
            from: &email.from,
            to: &email.to,
            subject: &email.subject,
            text: &email.body,
        };

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .context("calling mail API")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("mail API responded with {status}: {body}");
        }

        tracing::debug!(to = ?email.to, "mail API accepted email");
        Ok(())
    }
}

#[derive(Debug)]
pub enum Sender {
    /// Logs and drops every email. Used when no mail API key is configured.
    Disabled,
    Resend(ResendSender),
}

impl Sender {
    pub fn resend(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        client: reqwest::Client,
    ) -> Sender {
        Sender::Resend(ResendSender {
            api_url: api_url.into(),
            api_key: api_key.into(),
            client,
        })
    }
}

impl EmailSender for Sender {
    async fn send<'s>(&'s self, email: NotificationEmail) -> anyhow::Result<()> {
        match self {
            Sender::Disabled => {
                tracing::warn!(
                    to = ?email.to,
                    subject = %email.subject,
                    "skipping sending listing email (disabled)"
                );
                Ok(())
            }
            Sender::Resend(resend) => resend.send(email).await,
        }
    }
}

// ============================================================================
// NOTIFIER
// ============================================================================

pub fn compose(alert: &Alert, listing: &ListingEvent, from_address: &str) -> NotificationEmail {
    NotificationEmail {
        from: from_address.to_string(),
        to: vec![alert.recipient().to_string()],
        subject: format!("Hey! You have a new listing for a {}!", alert.vehicle),
        body: format!(
            "You can go visit the listing on their website at {}",
            listing.listing_url
        ),
    }
}

#[derive(Debug)]
pub struct Notifier<ES> {
    sender: ES,
    from_address: String,
    timeout: Duration,
}

impl<ES: EmailSender> Notifier<ES> {
    pub fn new(sender: ES, from_address: impl Into<String>, timeout: Duration) -> Self {
        Notifier {
            sender,
            from_address: from_address.into(),
            timeout,
        }
    }

    /// Sends one notification for `alert`. An attempt still running after the
    /// configured timeout is abandoned and reported as `TimedOut`.
    pub async fn notify(&self, alert: &Alert, listing: &ListingEvent) -> Result<(), NotificationError> {
        let email = compose(alert, listing, &self.from_address);
        let recipient = alert.recipient().to_string();

        let result = match tokio::time::timeout(self.timeout, self.sender.send(email)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(source)) => Err(NotificationError::Delivery { recipient, source }),
            Err(_elapsed) => Err(NotificationError::TimedOut {
                recipient,
                timeout: self.timeout,
            }),
        };

        match &result {
            Ok(()) => tracing::info!(
                alert_id = alert.id,
                recipient = %alert.recipient(),
                vehicle = %alert.vehicle,
                listing_url = %listing.listing_url,
                "sent listing notification"
            ),
            Err(error) => {
                let cause = match error {
                    NotificationError::Delivery { source, .. } => format!("{source:#}"),
                    NotificationError::TimedOut { timeout, .. } => format!("no response in {timeout:?}"),
                };
                tracing::error!(
                    alert_id = alert.id,
                    recipient = %alert.recipient(),
                    vehicle = %alert.vehicle,
                    %cause,
                    "failed to send listing notification"
                );
            }
        }

        result
    }
}
