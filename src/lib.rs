// Listing Watch - Core Library
// Matches incoming vehicle listings against users' alerts and emails them.
// Exposes all modules for use in the admin CLI, the ingress server, and tests

pub mod config;
pub mod db;
pub mod entities;
pub mod matcher;
pub mod notifier;
pub mod pipeline;
pub mod queue;

// Only compile the HTTP ingress when the server feature is enabled
#[cfg(feature = "server")]
pub mod ingress;

#[cfg(test)]
mod test_util;

// Re-export commonly used types
pub use config::{init_logging, LogFormat, ServiceConfig};
pub use db::{
    AlertSeed, AlertStore, SqliteStore, StoreError,
    delete_alert, import_alerts, insert_alert, list_alerts, load_alerts_csv, setup_database,
};
pub use entities::{Alert, AlertOwner, ListingEvent, Vehicle, VehicleRecord};
pub use matcher::{evaluate, matches, MatchDecision};
pub use notifier::{
    EmailSender, NotificationEmail, NotificationError, Notifier, Sender,
    DEFAULT_FROM_ADDRESS,
};
pub use pipeline::{IngestOutcome, IngestReport, IngestionPipeline, MatchMode, PipelineOptions};
pub use queue::{serve, IngestQueue, ServeStats, SubmitError};
