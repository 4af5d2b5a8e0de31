// 🚗 Vehicle Entity - what an alert watches for
//
// A vehicle is a value: two vehicles with the same (manufacturer, model, year)
// triple are the same vehicle, whatever row ids the store gave them.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// VEHICLE VALUE
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vehicle {
    /// Manufacturer as entered by the user (ex: "Toyota")
    pub manufacturer_name: String,

    /// Model as entered by the user (ex: "Corolla")
    pub model_name: String,

    /// Model year, kept as text because the listing producer sends text
    pub model_year: String,
}

impl Vehicle {
    pub fn new(
        manufacturer_name: impl Into<String>,
        model_name: impl Into<String>,
        model_year: impl Into<String>,
    ) -> Self {
        Vehicle {
            manufacturer_name: manufacturer_name.into(),
            model_name: model_name.into(),
            model_year: model_year.into(),
        }
    }
}

impl fmt::Display for Vehicle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.manufacturer_name, self.model_name, self.model_year
        )
    }
}

// ============================================================================
// STORED VEHICLE
// ============================================================================

/// A vehicle row as persisted by the alert store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub id: i64,
    pub vehicle: Vehicle,
}
