// 📰 Listing Event - one-shot notice that a vehicle was listed
//
// Listing events arrive over the ingress boundary, are consumed by exactly one
// pipeline run, and are never persisted.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEvent {
    pub manufacturer: String,
    pub model: String,
    pub model_year: String,
    pub branch: String,
    pub listing_url: String,

    /// Echo of `Alert::external_id` for the alert that subscribed to this vehicle
    pub correlation_id: Uuid,

    /// Listing date as reported by the producer (YYYY-MM-DD)
    pub date_listed: String,

    /// Producer-side inventory row id
    pub row_id: String,
}

impl ListingEvent {
    /// Content fingerprint used to recognise a redelivered listing.
    /// The correlation id is left out: the alert id it resolves to is paired
    /// with this fingerprint when a delivery is recorded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            &self.row_id,
            &self.branch,
            &self.listing_url,
            &self.manufacturer,
            &self.model,
            &self.model_year,
            &self.date_listed,
        ] {
            hasher.update(part.as_bytes());
            // Separator keeps ("ab", "c") and ("a", "bc") apart
            hasher.update(b"\x1f");
        }
        format!("{:x}", hasher.finalize())
    }
}
