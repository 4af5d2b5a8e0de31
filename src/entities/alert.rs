// 🔔 Alert Entity - a user's standing request for listings
//
// Alerts are created and deleted by the alert-management collaborator. The
// ingestion side only ever reads them.

use super::vehicle::Vehicle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The user an alert belongs to. Only what notification needs is carried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertOwner {
    pub id: i64,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    // ========================================================================
    // IDENTITY
    // ========================================================================
    pub id: i64,

    /// Correlation token handed to the listing producer at creation time.
    /// Listing events echo it back as `correlation_id`.
    pub external_id: Uuid,

    // ========================================================================
    // VALUES
    // ========================================================================
    pub owner: AlertOwner,
    pub vehicle: Vehicle,

    /// `None` matches any branch.
    pub branch: Option<String>,

    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Alert {
    /// Recipient address for notifications about this alert.
    pub fn recipient(&self) -> &str {
        &self.owner.email
    }
}
