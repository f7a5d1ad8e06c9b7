//! Fleet upkeep rules: expense totals per payer, vehicle status follow-up
//! for maintenance records, and insurance/ITV compliance.

use chrono::NaiveDate;
use serde::Serialize;

use crate::{
    models::{ExpensePayer, MaintenanceExpense, MaintenanceStatus, Vehicle, VehicleStatus},
    services::money::{from_cents, to_cents},
};

pub const EXPIRY_WARNING_DAYS: i64 = 30;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExpenseTotals {
    pub owner: f64,
    pub workshop: f64,
    pub third_party: f64,
    pub total: f64,
}

pub fn expense_totals(expenses: &[MaintenanceExpense]) -> ExpenseTotals {
    let (mut owner, mut workshop, mut third_party) = (0_i64, 0_i64, 0_i64);
    for expense in expenses {
        let cents = to_cents(expense.amount);
        match expense.payer {
            ExpensePayer::Owner => owner += cents,
            ExpensePayer::Workshop => workshop += cents,
            ExpensePayer::ThirdParty => third_party += cents,
        }
    }
    ExpenseTotals {
        owner: from_cents(owner),
        workshop: from_cents(workshop),
        third_party: from_cents(third_party),
        total: from_cents(owner + workshop + third_party),
    }
}

/// Vehicle status a record change should leave behind, if any.
/// `other_open_records` counts the vehicle's other in-progress records.
pub fn vehicle_status_after(
    record_status: MaintenanceStatus,
    current: VehicleStatus,
    other_open_records: i64,
) -> Option<VehicleStatus> {
    match (record_status, current) {
        (MaintenanceStatus::InProgress, VehicleStatus::Active) => Some(VehicleStatus::Maintenance),
        (MaintenanceStatus::Completed, VehicleStatus::Maintenance) if other_open_records == 0 => {
            Some(VehicleStatus::Active)
        }
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Validity {
    Valid,
    ExpiringSoon,
    Expired,
    Unknown,
}

pub fn validity(expiry: Option<NaiveDate>, today: NaiveDate) -> Validity {
    match expiry {
        None => Validity::Unknown,
        Some(date) if date < today => Validity::Expired,
        Some(date) if (date - today).num_days() <= EXPIRY_WARNING_DAYS => Validity::ExpiringSoon,
        Some(_) => Validity::Valid,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Compliance {
    pub insurance: Validity,
    pub itv: Validity,
}

impl Compliance {
    pub fn needs_attention(&self) -> bool {
        [self.insurance, self.itv]
            .iter()
            .any(|state| matches!(state, Validity::Expired | Validity::ExpiringSoon))
    }
}

pub fn compliance(vehicle: &Vehicle, today: NaiveDate) -> Compliance {
    Compliance {
        insurance: validity(vehicle.insurance_expiry, today),
        itv: validity(vehicle.itv_expiry, today),
    }
}
