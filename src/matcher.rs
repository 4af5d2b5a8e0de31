// 🎯 Matcher - does a listing satisfy an alert?
//
// Pure decision over one (alert, listing) pair. Branch compares exactly,
// manufacturer and model compare case-insensitively. Year is not checked here:
// candidates were already bound to a vehicle (by correlation id, or by the
// store's attribute lookup, which filters on year).

use crate::entities::{Alert, ListingEvent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchDecision {
    Matched,

    /// The alert is pinned to a different branch
    BranchMismatch,

    /// Manufacturer or model differ
    VehicleMismatch,
}

impl MatchDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchDecision::Matched => "matched",
            MatchDecision::BranchMismatch => "branch mismatch",
            MatchDecision::VehicleMismatch => "vehicle mismatch",
        }
    }
}

pub fn evaluate(alert: &Alert, listing: &ListingEvent) -> MatchDecision {
    if let Some(branch) = &alert.branch {
        if branch != &listing.branch {
            return MatchDecision::BranchMismatch;
        }
    }

    if !eq_ignore_case(&alert.vehicle.manufacturer_name, &listing.manufacturer)
        || !eq_ignore_case(&alert.vehicle.model_name, &listing.model)
    {
        return MatchDecision::VehicleMismatch;
    }

    MatchDecision::Matched
}

pub fn matches(alert: &Alert, listing: &ListingEvent) -> bool {
    evaluate(alert, listing) == MatchDecision::Matched
}

/// Case folding shared with the store's attribute lookup, so both matching
/// modes agree on which names are equal.
pub fn fold_case(value: &str) -> String {
    value.to_lowercase()
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a == b || fold_case(a) == fold_case(b)
}
