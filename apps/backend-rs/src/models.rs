//! Typed views over the rows returned by the table service.
//!
//! Rows travel through the repository as JSON objects (`row_to_json`); business
//! logic converts them into these structs at the boundary with [`from_row`].

use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::AppError;

pub fn from_row<T: DeserializeOwned>(row: &Value, entity: &str) -> Result<T, AppError> {
    serde_json::from_value(row.clone()).map_err(|error| {
        tracing::error!(entity, error = %error, "Stored row does not match its schema");
        AppError::Internal(format!("Malformed {entity} record."))
    })
}

/// JSON columns may come back as `null`; treat that like a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

pub fn from_rows<T: DeserializeOwned>(rows: &[Value], entity: &str) -> Result<Vec<T>, AppError> {
    rows.iter().map(|row| from_row(row, entity)).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Statuses that hold a vehicle for their window.
    pub fn blocks_vehicle(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::InProgress)
    }

    /// Manual transitions; `completed` is only reachable through the completion gate.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        match self {
            Self::Pending => matches!(next, Self::Confirmed | Self::Cancelled),
            Self::Confirmed => matches!(next, Self::InProgress | Self::Cancelled),
            Self::InProgress | Self::Completed | Self::Cancelled => false,
        }
    }
}

pub const BLOCKING_BOOKING_STATUSES: &[&str] = &["pending", "confirmed", "in_progress"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscountType {
    Flat,
    Percentage,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Discount {
    #[serde(rename = "discount_type")]
    pub kind: DiscountType,
    #[serde(rename = "discount_value")]
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    CardTerminal,
    CardTerminalSecondary,
    BankTransfer,
    Online,
}

impl PaymentMethod {
    pub fn is_cash(self) -> bool {
        matches!(self, Self::Cash)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cash => "cash",
            Self::CardTerminal => "card_terminal",
            Self::CardTerminalSecondary => "card_terminal_secondary",
            Self::BankTransfer => "bank_transfer",
            Self::Online => "online",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Held,
    Returned,
    PartiallyReturned,
}

impl DepositStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Held => "held",
            Self::Returned => "returned",
            Self::PartiallyReturned => "partially_returned",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InspectionKind {
    Delivery,
    Return,
}

impl InspectionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Delivery => "delivery",
            Self::Return => "return",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceType {
    Flat,
    PerDay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtraKind {
    Extra,
    Upgrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpensePayer {
    Owner,
    Workshop,
    ThirdParty,
}

impl ExpensePayer {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Workshop => "workshop",
            Self::ThirdParty => "third_party",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerDocumentType {
    IdFront,
    IdBack,
    Passport,
    DriverLicenseFront,
    DriverLicenseBack,
}

impl CustomerDocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::IdFront => "id_front",
            Self::IdBack => "id_back",
            Self::Passport => "passport",
            Self::DriverLicenseFront => "driver_license_front",
            Self::DriverLicenseBack => "driver_license_back",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "id_front" => Some(Self::IdFront),
            "id_back" => Some(Self::IdBack),
            "passport" => Some(Self::Passport),
            "driver_license_front" => Some(Self::DriverLicenseFront),
            "driver_license_back" => Some(Self::DriverLicenseBack),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    Active,
    Maintenance,
    Inactive,
}

impl VehicleStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Maintenance => "maintenance",
            Self::Inactive => "inactive",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceKind {
    Invoice,
    Ticket,
}

impl InvoiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::Ticket => "ticket",
        }
    }

    pub fn number_prefix(self) -> &'static str {
        match self {
            Self::Invoice => "F",
            Self::Ticket => "T",
        }
    }
}

fn default_quantity() -> u32 {
    1
}

/// An extra or upgrade attached to a booking, priced at booking time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BookingLine {
    #[serde(default)]
    pub extra_id: Option<String>,
    pub name: String,
    pub unit_price: f64,
    pub price_type: PriceType,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
    #[serde(default, rename = "totalPrice", alias = "total_price")]
    pub total_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdditionalDriver {
    pub full_name: String,
    #[serde(default)]
    pub national_id: Option<String>,
    #[serde(default)]
    pub driver_license_number: Option<String>,
    #[serde(default)]
    pub driver_license_expiry: Option<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: String,
    pub organization_id: String,
    pub customer_id: String,
    pub pickup_at: DateTime<Utc>,
    pub return_at: DateTime<Utc>,
    pub status: BookingStatus,
    #[serde(default)]
    pub total_price: f64,
    #[serde(default)]
    pub discount_type: Option<DiscountType>,
    #[serde(default)]
    pub discount_value: Option<f64>,
    #[serde(default)]
    pub include_insurance: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    pub extras: Vec<BookingLine>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub upgrades: Vec<BookingLine>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub additional_drivers: Vec<AdditionalDriver>,
    #[serde(default)]
    pub pickup_location: Option<String>,
    #[serde(default)]
    pub return_location: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl Booking {
    pub fn discount(&self) -> Option<Discount> {
        match (self.discount_type, self.discount_value) {
            (Some(kind), Some(value)) if value > 0.0 => Some(Discount { kind, value }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingVehicle {
    pub id: String,
    pub booking_id: String,
    pub vehicle_id: String,
    #[serde(default)]
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payment {
    pub id: String,
    pub booking_id: String,
    #[serde(default)]
    pub concept: Option<String>,
    pub amount: f64,
    pub method: PaymentMethod,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub id: String,
    pub booking_id: String,
    pub amount: f64,
    pub payment_method: PaymentMethod,
    pub status: DepositStatus,
    #[serde(default)]
    pub returned_amount: Option<f64>,
    #[serde(default)]
    pub withheld_amount: Option<f64>,
    #[serde(default)]
    pub withheld_damages: Option<f64>,
    #[serde(default)]
    pub withheld_fines: Option<f64>,
    #[serde(default)]
    pub withheld_extension: Option<f64>,
    #[serde(default)]
    pub withheld_other: Option<f64>,
    #[serde(default)]
    pub return_method: Option<PaymentMethod>,
    #[serde(default)]
    pub returned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Customer {
    pub id: String,
    pub organization_id: String,
    pub full_name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_e164: Option<String>,
    #[serde(default)]
    pub national_id: Option<String>,
    #[serde(default)]
    pub passport_number: Option<String>,
    #[serde(default)]
    pub driver_license_number: Option<String>,
    #[serde(default)]
    pub driver_license_expiry: Option<NaiveDate>,
    #[serde(default)]
    pub address_line: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub preferred_language: Option<String>,
}

impl Customer {
    pub fn first_name(&self) -> &str {
        self.full_name.split_whitespace().next().unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerDocument {
    pub id: String,
    pub customer_id: String,
    pub document_type: CustomerDocumentType,
    pub storage_key: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vehicle {
    pub id: String,
    pub organization_id: String,
    pub registration: String,
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub vehicle_type: Option<String>,
    #[serde(default)]
    pub vehicle_group: Option<String>,
    pub status: VehicleStatus,
    #[serde(default)]
    pub insurance_expiry: Option<NaiveDate>,
    #[serde(default)]
    pub itv_expiry: Option<NaiveDate>,
}

impl Vehicle {
    pub fn display_name(&self) -> String {
        let label = [self.brand.as_deref(), self.model.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if label.is_empty() {
            self.registration.clone()
        } else {
            format!("{label} ({})", self.registration)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Damage {
    pub location: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub resolved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inspection {
    pub id: String,
    pub organization_id: String,
    pub booking_id: String,
    pub vehicle_id: String,
    pub kind: InspectionKind,
    #[serde(default)]
    pub paired_inspection_id: Option<String>,
    #[serde(default)]
    pub odometer_km: Option<i64>,
    #[serde(default)]
    pub fuel_level: Option<i32>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub damages: Vec<Damage>,
    pub inspected_at: DateTime<Utc>,
}

impl Inspection {
    pub fn unresolved_damages(&self) -> impl Iterator<Item = &Damage> {
        self.damages.iter().filter(|damage| !damage.resolved)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InspectionPhoto {
    pub id: String,
    pub inspection_id: String,
    pub storage_key: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub id: String,
    pub organization_id: String,
    pub booking_id: String,
    pub contract_number: String,
    #[serde(default)]
    pub signed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub signer_name: Option<String>,
    #[serde(default)]
    pub signature_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTier {
    pub days: i64,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingGroup {
    pub id: String,
    pub organization_id: String,
    pub vehicle_group: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub tiers: Vec<PriceTier>,
    #[serde(default)]
    pub extra_day_price: f64,
    #[serde(default)]
    pub insurance_per_day: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RentalExtra {
    pub id: String,
    pub organization_id: String,
    pub kind: ExtraKind,
    pub name: String,
    pub unit_price: f64,
    pub price_type: PriceType,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub org_slug: Option<String>,
    #[serde(default)]
    pub legal_name: Option<String>,
    #[serde(default)]
    pub tax_id: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub booking_widget_enabled: bool,
    #[serde(default)]
    pub contact_email: Option<String>,
    #[serde(default)]
    pub contact_phone: Option<String>,
    #[serde(default)]
    pub default_locale: Option<String>,
    #[serde(default)]
    pub review_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceStatus {
    Scheduled,
    InProgress,
    Completed,
}

impl MaintenanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceKind {
    Service,
    Repair,
    Tyres,
    Itv,
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceRecord {
    pub id: String,
    pub organization_id: String,
    pub vehicle_id: String,
    pub status: MaintenanceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceExpense {
    pub id: String,
    pub maintenance_record_id: String,
    pub concept: String,
    pub amount: f64,
    pub payer: ExpensePayer,
}

#[cfg(test)]
mod tests {
    use super::{from_row, Booking, BookingLine, BookingStatus, PriceType, PricingGroup};
    use serde_json::json;

    #[test]
    fn booking_status_transitions() {
        assert!(BookingStatus::Pending.can_transition_to(BookingStatus::Confirmed));
        assert!(BookingStatus::Confirmed.can_transition_to(BookingStatus::InProgress));
        assert!(!BookingStatus::InProgress.can_transition_to(BookingStatus::Completed));
        assert!(!BookingStatus::Completed.can_transition_to(BookingStatus::Cancelled));
        assert!(!BookingStatus::Pending.can_transition_to(BookingStatus::InProgress));
    }

    #[test]
    fn parses_postgres_booking_rows() {
        let row = json!({
            "id": "b1",
            "organization_id": "o1",
            "customer_id": "c1",
            "pickup_at": "2026-07-01T10:00:00+00:00",
            "return_at": "2026-07-03T10:00:00+00:00",
            "status": "in_progress",
            "total_price": 100.5,
            "discount_type": null,
            "extras": [{"name": "Helmet", "unit_price": 3, "price_type": "per_day", "totalPrice": 6}],
            "upgrades": null,
            "created_at": "2026-06-01T08:00:00.123456+00:00"
        });
        let booking: Booking = from_row(&row, "bookings").expect("valid row");
        assert_eq!(booking.status, BookingStatus::InProgress);
        assert_eq!(booking.extras.len(), 1);
        assert_eq!(booking.extras[0].quantity, 1);
        assert!(booking.upgrades.is_empty());
        assert!(booking.discount().is_none());
    }

    #[test]
    fn null_json_columns_read_as_empty() {
        let row = json!({
            "id": "g1",
            "organization_id": "o1",
            "vehicle_group": "scooter-125",
            "tiers": null,
            "extra_day_price": 20
        });
        let group: PricingGroup = from_row(&row, "pricing_groups").expect("valid row");
        assert!(group.tiers.is_empty());
        assert_eq!(group.extra_day_price, 20.0);
    }

    #[test]
    fn booking_line_accepts_both_total_spellings() {
        let line: BookingLine = serde_json::from_value(json!({
            "name": "GPS", "unit_price": 5, "price_type": "flat", "total_price": 5
        }))
        .expect("line");
        assert_eq!(line.price_type, PriceType::Flat);
        assert_eq!(line.total_price, 5.0);
    }
}
