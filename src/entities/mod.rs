// Entity Models
//
// Vehicles are values, alerts are stored read-only snapshots, and listing
// events are ephemeral input.

pub mod alert;
pub mod listing;
pub mod vehicle;

pub use alert::{Alert, AlertOwner};
pub use listing::ListingEvent;
pub use vehicle::{Vehicle, VehicleRecord};
