// ⚙️ Service Configuration - flags and environment shared by both binaries

use crate::db::SqliteStore;
use crate::notifier::{Notifier, Sender, DEFAULT_FROM_ADDRESS, DEFAULT_MAIL_API_URL};
use crate::pipeline::{IngestionPipeline, MatchMode, PipelineOptions};
use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, clap::Args)]
pub struct ServiceConfig {
    /// Path of the SQLite alert database.
    #[clap(long = "database", env = "WATCH_DATABASE", default_value = "watch.db")]
    pub database: PathBuf,

    /// Sender address of listing notifications.
    #[clap(long, env = "WATCH_FROM_ADDRESS", default_value = DEFAULT_FROM_ADDRESS)]
    pub from_address: String,

    /// Endpoint of the Resend-compatible mail API.
    #[clap(long, env = "WATCH_MAIL_API_URL", default_value = DEFAULT_MAIL_API_URL)]
    pub mail_api_url: String,

    /// API key of the mail API. Emails are logged and dropped when unset.
    #[clap(long, env = "RESEND_API_KEY", hide_env_values = true)]
    pub mail_api_key: Option<String>,

    /// Give up on a single notification after this long.
    #[clap(long, value_parser = humantime::parse_duration, default_value = "30s")]
    pub notification_timeout: Duration,

    /// Notifications sent in parallel for one listing.
    #[clap(long, default_value = "4")]
    pub notify_concurrency: usize,

    /// How listings find their candidate alerts.
    #[clap(long, value_enum, env = "WATCH_MATCH_MODE", default_value = "correlation")]
    pub match_mode: MatchMode,

    /// Notify again when the same listing is delivered twice.
    #[clap(long)]
    pub allow_duplicate_deliveries: bool,

    /// Format of log output on stderr. Filtering follows RUST_LOG.
    #[clap(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

impl ServiceConfig {
    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            match_mode: self.match_mode,
            dedupe: !self.allow_duplicate_deliveries,
            notify_concurrency: self.notify_concurrency,
        }
    }

    pub fn sender(&self) -> anyhow::Result<Sender> {
        let Some(api_key) = &self.mail_api_key else {
            tracing::warn!("no mail API key configured, listing emails will not be sent");
            return Ok(Sender::Disabled);
        };

        let client = reqwest::Client::builder()
            .timeout(self.notification_timeout)
            .build()
            .context("building mail API client")?;

        Ok(Sender::resend(&self.mail_api_url, api_key, client))
    }

    pub fn open_store(&self) -> anyhow::Result<SqliteStore> {
        SqliteStore::open(&self.database)
    }

    pub fn build_pipeline(&self) -> anyhow::Result<IngestionPipeline<SqliteStore, Sender>> {
        let store = self.open_store()?;
        let notifier = Notifier::new(self.sender()?, &self.from_address, self.notification_timeout);

        Ok(IngestionPipeline::new(store, notifier, self.pipeline_options()))
    }
}

/// Installs the global tracing subscriber. `RUST_LOG` overrides the default
/// `info` level.
pub fn init_logging(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
