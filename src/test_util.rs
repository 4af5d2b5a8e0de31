use crate::db::{insert_alert, SqliteStore};
use crate::entities::{Alert, AlertOwner, ListingEvent, Vehicle};
use crate::notifier::{EmailSender, NotificationEmail};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Records sent emails, and fails or stalls on demand.
#[derive(Debug, Clone)]
pub struct TestSender(Arc<Mutex<TestSenderInner>>);

#[derive(Debug, Default)]
struct TestSenderInner {
    attempts: usize,
    fail_attempts: HashSet<usize>,
    fail_recipients: HashSet<String>,
    delay: Option<Duration>,
    sent: Vec<NotificationEmail>,
}

impl TestSender {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(TestSenderInner::default())))
    }

    pub async fn sent(&self) -> Vec<NotificationEmail> {
        self.0.lock().await.sent.clone()
    }

    pub async fn attempts(&self) -> usize {
        self.0.lock().await.attempts
    }

    /// Fails the `attempt`-th send (1-based).
    pub async fn fail_attempt(&self, attempt: usize) {
        self.0.lock().await.fail_attempts.insert(attempt);
    }

    pub async fn fail_for(&self, recipient: &str) {
        self.0.lock().await.fail_recipients.insert(recipient.to_string());
    }

    pub async fn set_delay(&self, delay: Duration) {
        self.0.lock().await.delay = Some(delay);
    }
}

impl EmailSender for TestSender {
    async fn send<'s>(&'s self, email: NotificationEmail) -> anyhow::Result<()> {
        let (attempt, delay) = {
            let mut lock = self.0.lock().await;
            lock.attempts += 1;
            (lock.attempts, lock.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut lock = self.0.lock().await;
        if lock.fail_attempts.contains(&attempt)
            || email.to.iter().any(|to| lock.fail_recipients.contains(to))
        {
            anyhow::bail!("mock error sending listing email to {:?}", email.to);
        }
        lock.sent.push(email);
        Ok(())
    }
}

pub fn alert(
    email: &str,
    manufacturer: &str,
    model: &str,
    year: &str,
    branch: Option<&str>,
) -> Alert {
    Alert {
        id: 1,
        external_id: Uuid::new_v4(),
        owner: AlertOwner {
            id: 1,
            email: email.to_string(),
        },
        vehicle: Vehicle::new(manufacturer, model, year),
        branch: branch.map(str::to_string),
        created_at: Utc::now(),
        modified_at: Utc::now(),
    }
}

/// A listing that echoes `alert`'s correlation id.
pub fn listing(
    alert: &Alert,
    manufacturer: &str,
    model: &str,
    year: &str,
    branch: &str,
) -> ListingEvent {
    ListingEvent {
        manufacturer: manufacturer.to_string(),
        model: model.to_string(),
        model_year: year.to_string(),
        branch: branch.to_string(),
        listing_url: "https://www.kennyupull.com/listing/A12".to_string(),
        correlation_id: alert.external_id,
        date_listed: "2020-01-01".to_string(),
        row_id: "A12".to_string(),
    }
}

pub fn seed_alert(store: &SqliteStore, email: &str, vehicle: &Vehicle, branch: Option<&str>) -> Alert {
    store
        .with_conn(|conn| insert_alert(conn, email, vehicle, branch))
        .unwrap()
        .unwrap()
}
