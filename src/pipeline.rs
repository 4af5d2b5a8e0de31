// 🔁 Ingestion Pipeline - listing event in, notifications out
//
// One run per listing event: resolve candidate alerts, apply the matcher,
// notify every match exactly once. Nothing escapes to the caller; outcomes
// are logged and summarised in an `IngestReport`.

use crate::db::{AlertStore, StoreError};
use crate::entities::{Alert, ListingEvent};
use crate::matcher::{self, MatchDecision};
use crate::notifier::{EmailSender, Notifier};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

// ============================================================================
// OPTIONS
// ============================================================================

/// How candidate alerts are found for a listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    /// The alert named by the listing's correlation id is the only candidate.
    #[default]
    Correlation,

    /// Every alert on a vehicle with the listing's (manufacturer, model, year).
    /// Several alerts sharing a vehicle are all candidates.
    Attributes,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub match_mode: MatchMode,

    /// Skip alerts already notified about the same listing content
    pub dedupe: bool,

    /// Upper bound on notification sends in flight within one run
    pub notify_concurrency: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            match_mode: MatchMode::Correlation,
            dedupe: true,
            notify_concurrency: 4,
        }
    }
}

// ============================================================================
// REPORT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestOutcome {
    /// The correlation id names no existing alert
    UnknownCorrelation,

    /// Candidates were found but none passed the matcher
    NoMatchingAlerts,

    /// At least one alert matched and was attempted
    Notified,

    /// Every matching alert had already been notified about this listing
    AlreadyDelivered,

    /// The store could not be read; the listing was abandoned
    StoreUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub outcome: IngestOutcome,
    pub candidates: usize,
    pub matched: usize,
    pub sent: usize,
    pub failed: usize,
    pub duplicates: usize,
}

impl IngestReport {
    fn new(outcome: IngestOutcome) -> Self {
        IngestReport {
            outcome,
            candidates: 0,
            matched: 0,
            sent: 0,
            failed: 0,
            duplicates: 0,
        }
    }
}

enum Delivery {
    Sent,
    Failed,
    Duplicate,
}

// ============================================================================
// PIPELINE
// ============================================================================

#[derive(Debug)]
pub struct IngestionPipeline<S, ES> {
    store: S,
    notifier: Notifier<ES>,
    options: PipelineOptions,
}

impl<S: AlertStore, ES: EmailSender> IngestionPipeline<S, ES> {
    pub fn new(store: S, notifier: Notifier<ES>, options: PipelineOptions) -> Self {
        IngestionPipeline {
            store,
            notifier,
            options,
        }
    }

    /// Runs `listing` to completion. Every notification attempt has finished
    /// or timed out by the time this returns.
    #[tracing::instrument(
        skip_all,
        fields(correlation_id = %listing.correlation_id, row_id = %listing.row_id)
    )]
    pub async fn ingest(&self, listing: ListingEvent) -> IngestReport {
        tracing::info!(
            manufacturer = %listing.manufacturer,
            model = %listing.model,
            model_year = %listing.model_year,
            branch = %listing.branch,
            "got a new listing to ingest"
        );

        let candidates = match self.resolve_candidates(&listing) {
            Ok(Some(candidates)) => candidates,
            Ok(None) => {
                tracing::info!("no alert is watching this correlation id, nothing to do");
                return IngestReport::new(IngestOutcome::UnknownCorrelation);
            }
            Err(error) => {
                tracing::error!(?error, "alert store unavailable, abandoning listing");
                return IngestReport::new(IngestOutcome::StoreUnavailable);
            }
        };

        let mut report = IngestReport::new(IngestOutcome::NoMatchingAlerts);
        report.candidates = candidates.len();

        let matched: Vec<Alert> = candidates
            .into_iter()
            .filter(|alert| {
                let decision = matcher::evaluate(alert, &listing);
                if decision != MatchDecision::Matched {
                    tracing::info!(
                        alert_id = alert.id,
                        reason = decision.as_str(),
                        "listing does not match alert, skipping"
                    );
                }
                decision == MatchDecision::Matched
            })
            .collect();
        report.matched = matched.len();

        if matched.is_empty() {
            tracing::info!(candidates = report.candidates, "no matching alerts for listing");
            return report;
        }

        let fingerprint = listing.fingerprint();
        let limit = Semaphore::new(self.options.notify_concurrency.max(1));

        let mut attempts = Vec::with_capacity(matched.len());
        for alert in &matched {
            attempts.push(self.deliver(alert, &listing, &fingerprint, &limit));
        }

        for delivery in futures::future::join_all(attempts).await {
            match delivery {
                Delivery::Sent => report.sent += 1,
                Delivery::Failed => report.failed += 1,
                Delivery::Duplicate => report.duplicates += 1,
            }
        }
        report.outcome = if report.sent + report.failed > 0 {
            IngestOutcome::Notified
        } else {
            IngestOutcome::AlreadyDelivered
        };

        tracing::info!(
            matched = report.matched,
            sent = report.sent,
            failed = report.failed,
            duplicates = report.duplicates,
            "finished ingesting listing"
        );
        report
    }

    /// `Ok(None)` means the listing's correlation id is unknown.
    fn resolve_candidates(&self, listing: &ListingEvent) -> Result<Option<Vec<Alert>>, StoreError> {
        match self.options.match_mode {
            MatchMode::Correlation => Ok(self
                .store
                .find_alert_by_external_id(&listing.correlation_id)?
                .map(|alert| vec![alert])),
            MatchMode::Attributes => {
                let mut alerts = Vec::new();
                for record in self.store.find_vehicles_by_attributes(
                    &listing.manufacturer,
                    &listing.model,
                    &listing.model_year,
                )? {
                    alerts.extend(self.store.find_alerts_by_vehicle(record.id)?);
                }
                Ok(Some(alerts))
            }
        }
    }

    async fn deliver(
        &self,
        alert: &Alert,
        listing: &ListingEvent,
        fingerprint: &str,
        limit: &Semaphore,
    ) -> Delivery {
        let _permit = limit.acquire().await;

        // Recorded only after a successful send: concurrent redeliveries may
        // both send, but a failed send never hides the listing from a retry.
        if self.options.dedupe {
            match self.store.is_delivered(alert.id, fingerprint) {
                Ok(false) => {}
                Ok(true) => {
                    tracing::info!(
                        alert_id = alert.id,
                        recipient = %alert.recipient(),
                        "listing was already delivered for this alert, skipping"
                    );
                    return Delivery::Duplicate;
                }
                Err(error) => {
                    tracing::error!(
                        alert_id = alert.id,
                        recipient = %alert.recipient(),
                        vehicle = %alert.vehicle,
                        ?error,
                        "could not check delivery ledger, skipping alert"
                    );
                    return Delivery::Failed;
                }
            }
        }

        if self.notifier.notify(alert, listing).await.is_err() {
            return Delivery::Failed;
        }

        if self.options.dedupe {
            if let Err(error) = self.store.record_delivery(alert.id, fingerprint) {
                tracing::warn!(
                    alert_id = alert.id,
                    ?error,
                    "could not record delivery, a redelivered listing will be sent again"
                );
            }
        }
        Delivery::Sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{delete_alert, SqliteStore};
    use crate::entities::{Vehicle, VehicleRecord};
    use crate::notifier::DEFAULT_FROM_ADDRESS;
    use crate::test_util::{listing, seed_alert, TestSender};
    use std::time::Duration;
    use tracing_test::traced_test;
    use uuid::Uuid;

    fn pipeline(
        store: SqliteStore,
        sender: &TestSender,
        options: PipelineOptions,
    ) -> IngestionPipeline<SqliteStore, TestSender> {
        let notifier = Notifier::new(sender.clone(), DEFAULT_FROM_ADDRESS, Duration::from_secs(5));
        IngestionPipeline::new(store, notifier, options)
    }

    fn attributes_mode() -> PipelineOptions {
        PipelineOptions {
            match_mode: MatchMode::Attributes,
            notify_concurrency: 1,
            ..Default::default()
        }
    }

    fn corolla() -> Vehicle {
        Vehicle::new("Toyota", "Corolla", "1996")
    }

    #[tokio::test]
    async fn test_matching_branch_sends_one_email() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alert = seed_alert(&store, "tester@test.com", &corolla(), Some("Ottawa"));
        let sender = TestSender::new();
        let pipeline = pipeline(store, &sender, PipelineOptions::default());

        let report = pipeline
            .ingest(listing(&alert, "Toyota", "Corolla", "1996", "Ottawa"))
            .await;

        assert_eq!(report.outcome, IngestOutcome::Notified);
        assert_eq!((report.candidates, report.matched, report.sent), (1, 1, 1));

        let sent = sender.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].subject.contains("Toyota Corolla"));
        assert!(sent[0].body.contains("https://www.kennyupull.com/listing/A12"));
        assert_eq!(sent[0].to, vec!["tester@test.com".to_string()]);
        assert_eq!(sent[0].from, DEFAULT_FROM_ADDRESS);
    }

    #[tokio::test]
    async fn test_other_branch_sends_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alert = seed_alert(&store, "tester@test.com", &corolla(), Some("Ottawa"));
        let sender = TestSender::new();
        let pipeline = pipeline(store, &sender, PipelineOptions::default());

        let report = pipeline
            .ingest(listing(&alert, "Toyota", "Corolla", "1996", "St-Test"))
            .await;

        assert_eq!(report.outcome, IngestOutcome::NoMatchingAlerts);
        assert_eq!(report.candidates, 1);
        assert_eq!(sender.attempts().await, 0);
    }

    #[tokio::test]
    async fn test_any_branch_alert_matches_anywhere() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alert = seed_alert(&store, "tester@test.com", &corolla(), None);
        let sender = TestSender::new();
        let pipeline = pipeline(store, &sender, PipelineOptions::default());

        let report = pipeline
            .ingest(listing(&alert, "toyota", "corolla", "1996", "Anywhere"))
            .await;

        assert_eq!(report.sent, 1);
        assert_eq!(sender.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_vehicle_mismatch_on_correlated_alert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alert = seed_alert(&store, "tester@test.com", &corolla(), None);
        let sender = TestSender::new();
        let pipeline = pipeline(store, &sender, PipelineOptions::default());

        let report = pipeline
            .ingest(listing(&alert, "Honda", "Civic", "1996", "Ottawa"))
            .await;

        assert_eq!(report.outcome, IngestOutcome::NoMatchingAlerts);
        assert!(sender.sent().await.is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_empty_store_completes_quietly() {
        let store = SqliteStore::open_in_memory().unwrap();
        let sender = TestSender::new();
        let pipeline = pipeline(store, &sender, PipelineOptions::default());
        let stranger = crate::test_util::alert("nobody@test.com", "Honda", "Civic", "1996", None);

        let report = pipeline
            .ingest(listing(&stranger, "Honda", "Civic", "1996", "Ottawa"))
            .await;

        assert_eq!(report.outcome, IngestOutcome::UnknownCorrelation);
        assert_eq!(sender.attempts().await, 0);
        assert!(logs_contain("no alert is watching this correlation id"));
    }

    #[tokio::test]
    async fn test_deleted_alert_is_unknown_correlation() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alert = seed_alert(&store, "tester@test.com", &corolla(), None);
        store
            .with_conn(|conn| delete_alert(conn, &alert.external_id))
            .unwrap()
            .unwrap();
        let sender = TestSender::new();
        let pipeline = pipeline(store, &sender, PipelineOptions::default());

        let report = pipeline
            .ingest(listing(&alert, "Toyota", "Corolla", "1996", "Ottawa"))
            .await;

        assert_eq!(report.outcome, IngestOutcome::UnknownCorrelation);
        assert_eq!(sender.attempts().await, 0);
    }

    #[tokio::test]
    async fn test_attributes_mode_notifies_every_matching_alert() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = seed_alert(&store, "a@test.com", &corolla(), None);
        seed_alert(&store, "b@test.com", &corolla(), Some("Ottawa"));
        seed_alert(&store, "c@test.com", &corolla(), Some("St-Test"));
        seed_alert(&store, "d@test.com", &Vehicle::new("Toyota", "Corolla", "1997"), None);
        let sender = TestSender::new();
        let pipeline = pipeline(store, &sender, attributes_mode());

        let report = pipeline
            .ingest(listing(&first, "TOYOTA", "corolla", "1996", "Ottawa"))
            .await;

        assert_eq!((report.candidates, report.matched, report.sent), (3, 2, 2));
        let recipients: Vec<String> = sender
            .sent()
            .await
            .into_iter()
            .flat_map(|email| email.to)
            .collect();
        assert_eq!(recipients, vec!["a@test.com", "b@test.com"]);
    }

    #[tokio::test]
    async fn test_modes_agree_on_non_ascii_case() {
        let octavia = Vehicle::new("Škoda", "Octavia", "2010");

        for options in [PipelineOptions::default(), attributes_mode()] {
            let store = SqliteStore::open_in_memory().unwrap();
            let alert = seed_alert(&store, "tester@test.com", &octavia, None);
            let sender = TestSender::new();
            let pipeline = pipeline(store, &sender, options);

            let report = pipeline
                .ingest(listing(&alert, "ŠKODA", "OCTAVIA", "2010", "Ottawa"))
                .await;

            assert_eq!(report.sent, 1);
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_failed_attempt_does_not_stop_siblings() {
        const MATCHING: usize = 4;

        for failing in 1..=MATCHING {
            let store = SqliteStore::open_in_memory().unwrap();
            let mut alerts = Vec::new();
            for n in 0..MATCHING {
                alerts.push(seed_alert(&store, &format!("user{n}@test.com"), &corolla(), None));
            }
            // One non-matching candidate
            seed_alert(&store, "elsewhere@test.com", &corolla(), Some("Gatineau"));

            let sender = TestSender::new();
            sender.fail_attempt(failing).await;
            let pipeline = pipeline(store, &sender, attributes_mode());

            let report = pipeline
                .ingest(listing(&alerts[0], "Toyota", "Corolla", "1996", "Ottawa"))
                .await;

            assert_eq!(report.candidates, MATCHING + 1);
            assert_eq!(report.matched, MATCHING);
            assert_eq!(sender.attempts().await, MATCHING);
            assert_eq!(report.failed, 1);
            assert_eq!(report.sent, MATCHING - 1);
            assert_eq!(report.outcome, IngestOutcome::Notified);
        }
        assert!(logs_contain("failed to send listing notification"));
    }

    #[tokio::test]
    async fn test_redelivered_listing_is_not_sent_twice() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alert = seed_alert(&store, "tester@test.com", &corolla(), None);
        let sender = TestSender::new();
        let pipeline = pipeline(store, &sender, PipelineOptions::default());
        let event = listing(&alert, "Toyota", "Corolla", "1996", "Ottawa");

        let first = pipeline.ingest(event.clone()).await;
        let second = pipeline.ingest(event).await;

        assert_eq!(first.sent, 1);
        assert_eq!((second.sent, second.duplicates), (0, 1));
        assert_eq!(second.outcome, IngestOutcome::AlreadyDelivered);
        assert_eq!(sender.sent().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_redelivery_survives_failed_first_send() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alert = seed_alert(&store, "tester@test.com", &corolla(), None);
        let sender = TestSender::new();
        sender.fail_attempt(1).await;
        sender.set_delay(Duration::from_secs(1)).await;
        let pipeline = pipeline(store, &sender, PipelineOptions::default());
        let event = listing(&alert, "Toyota", "Corolla", "1996", "Ottawa");

        let (first, second) = tokio::join!(
            pipeline.ingest(event.clone()),
            pipeline.ingest(event.clone())
        );

        assert_eq!(first.sent + second.sent, 1);
        assert_eq!(first.failed + second.failed, 1);
        assert_eq!(sender.attempts().await, 2);
        assert_eq!(sender.sent().await.len(), 1);

        // The successful send is on record now
        let third = pipeline.ingest(event).await;
        assert_eq!(third.outcome, IngestOutcome::AlreadyDelivered);
        assert_eq!(sender.attempts().await, 2);
    }

    #[tokio::test]
    async fn test_duplicates_allowed_when_dedupe_disabled() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alert = seed_alert(&store, "tester@test.com", &corolla(), None);
        let sender = TestSender::new();
        let options = PipelineOptions {
            dedupe: false,
            ..Default::default()
        };
        let pipeline = pipeline(store, &sender, options);
        let event = listing(&alert, "Toyota", "Corolla", "1996", "Ottawa");

        pipeline.ingest(event.clone()).await;
        pipeline.ingest(event).await;

        assert_eq!(sender.sent().await.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_send_can_be_retried_by_redelivery() {
        let store = SqliteStore::open_in_memory().unwrap();
        let alert = seed_alert(&store, "tester@test.com", &corolla(), None);
        let sender = TestSender::new();
        sender.fail_attempt(1).await;
        let pipeline = pipeline(store, &sender, PipelineOptions::default());
        let event = listing(&alert, "Toyota", "Corolla", "1996", "Ottawa");

        let first = pipeline.ingest(event.clone()).await;
        let second = pipeline.ingest(event).await;

        assert_eq!(first.failed, 1);
        assert_eq!(second.sent, 1);
        assert_eq!(sender.sent().await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stuck_sends_are_bounded_and_run_concurrently() {
        let store = SqliteStore::open_in_memory().unwrap();
        let first = seed_alert(&store, "a@test.com", &corolla(), None);
        seed_alert(&store, "b@test.com", &corolla(), None);
        seed_alert(&store, "c@test.com", &corolla(), None);
        let sender = TestSender::new();
        sender.set_delay(Duration::from_secs(600)).await;
        let notifier = Notifier::new(sender.clone(), DEFAULT_FROM_ADDRESS, Duration::from_secs(10));
        let options = PipelineOptions {
            match_mode: MatchMode::Attributes,
            notify_concurrency: 3,
            ..Default::default()
        };
        let pipeline = IngestionPipeline::new(store, notifier, options);

        let started = tokio::time::Instant::now();
        let report = pipeline
            .ingest(listing(&first, "Toyota", "Corolla", "1996", "Ottawa"))
            .await;

        assert_eq!((report.matched, report.failed, report.sent), (3, 3, 0));
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[derive(Debug)]
    struct UnavailableStore;

    impl AlertStore for UnavailableStore {
        fn find_alert_by_external_id(&self, _: &Uuid) -> Result<Option<Alert>, StoreError> {
            Err(StoreError::Poisoned)
        }

        fn find_vehicles_by_attributes(
            &self,
            _: &str,
            _: &str,
            _: &str,
        ) -> Result<Vec<VehicleRecord>, StoreError> {
            Err(StoreError::Poisoned)
        }

        fn find_alerts_by_vehicle(&self, _: i64) -> Result<Vec<Alert>, StoreError> {
            Err(StoreError::Poisoned)
        }

        fn is_delivered(&self, _: i64, _: &str) -> Result<bool, StoreError> {
            Err(StoreError::Poisoned)
        }

        fn record_delivery(&self, _: i64, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Poisoned)
        }
    }

    #[tokio::test]
    #[traced_test]
    async fn test_store_outage_abandons_listing() {
        let sender = TestSender::new();
        let notifier = Notifier::new(sender.clone(), DEFAULT_FROM_ADDRESS, Duration::from_secs(5));
        let pipeline = IngestionPipeline::new(UnavailableStore, notifier, PipelineOptions::default());
        let stranger = crate::test_util::alert("nobody@test.com", "Honda", "Civic", "1996", None);

        let report = pipeline
            .ingest(listing(&stranger, "Honda", "Civic", "1996", "Ottawa"))
            .await;

        assert_eq!(report.outcome, IngestOutcome::StoreUnavailable);
        assert_eq!(sender.attempts().await, 0);
        assert!(logs_contain("alert store unavailable"));
    }
}
