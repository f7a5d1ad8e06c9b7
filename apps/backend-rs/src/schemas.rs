use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::{Validate, ValidationError};

use crate::{
    error::AppError,
    models::{
        AdditionalDriver, BookingStatus, Damage, Discount, DiscountType, DepositStatus,
        ExpensePayer, ExtraKind, InspectionKind, InvoiceKind, MaintenanceKind,
        MaintenanceStatus, PaymentMethod, PriceTier, PriceType, VehicleStatus,
    },
    services::money::to_cents,
};

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

pub fn clamp_limit(limit: i64) -> i64 {
    clamp_limit_in_range(limit, 1, 500)
}

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

pub fn serialize_to_map<T>(value: &T) -> Map<String, Value>
where
    T: Serialize,
{
    let json = serde_json::to_value(value).unwrap_or_else(|_| Value::Object(Map::new()));
    json.as_object().cloned().unwrap_or_default()
}

pub fn remove_nulls(mut map: Map<String, Value>) -> Map<String, Value> {
    map.retain(|_, value| !value.is_null());
    map
}

pub fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

pub fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}

/// Rejects an update payload that would change nothing.
pub fn non_empty_patch(patch: Map<String, Value>) -> Result<Map<String, Value>, AppError> {
    if patch.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }
    Ok(patch)
}

fn default_limit_100() -> i64 {
    100
}
fn default_limit_200() -> i64 {
    200
}
fn default_true() -> bool {
    true
}
fn default_quantity() -> u32 {
    1
}
fn default_currency_eur() -> String {
    "EUR".to_string()
}
fn default_signing_hours() -> i64 {
    72
}

pub fn discount_from(kind: Option<DiscountType>, value: Option<f64>) -> Option<Discount> {
    match (kind, value) {
        (Some(kind), Some(value)) if value > 0.0 => Some(Discount { kind, value }),
        _ => None,
    }
}

fn is_slug(raw: &str) -> bool {
    !raw.is_empty()
        && raw.len() <= 64
        && raw
            .chars()
            .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-')
        && !raw.starts_with('-')
        && !raw.ends_with('-')
}

pub fn check_slug(raw: Option<&str>) -> Result<(), AppError> {
    match raw {
        Some(slug) if !is_slug(slug) => Err(AppError::UnprocessableEntity(
            "org_slug may only contain lowercase letters, digits and dashes.".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Tiers need positive, distinct day counts and non-negative prices.
pub fn check_tiers(tiers: &[PriceTier]) -> Result<(), AppError> {
    if tiers.is_empty() {
        return Err(AppError::UnprocessableEntity(
            "A pricing group needs at least one tier.".to_string(),
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for tier in tiers {
        if tier.days <= 0 || !tier.price.is_finite() || tier.price < 0.0 {
            return Err(AppError::UnprocessableEntity(format!(
                "Invalid tier for {} days.",
                tier.days
            )));
        }
        if !seen.insert(tier.days) {
            return Err(AppError::UnprocessableEntity(format!(
                "Duplicate tier for {} days.",
                tier.days
            )));
        }
    }
    Ok(())
}

pub fn check_window(pickup_at: DateTime<Utc>, return_at: DateTime<Utc>) -> Result<(), AppError> {
    if return_at <= pickup_at {
        return Err(AppError::BadRequest(
            "return_at must be after pickup_at.".to_string(),
        ));
    }
    Ok(())
}

// ── Paths ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct OrgPath {
    pub org_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerPath {
    pub customer_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomerDocumentPath {
    pub customer_id: String,
    pub document_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VehiclePath {
    pub vehicle_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VehicleDocumentPath {
    pub vehicle_id: String,
    pub document_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenancePath {
    pub record_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpensePath {
    pub record_id: String,
    pub expense_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingGroupPath {
    pub group_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtraPath {
    pub extra_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BookingPath {
    pub booking_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentPath {
    pub booking_id: String,
    pub payment_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepositPath {
    pub booking_id: String,
    pub deposit_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InspectionPath {
    pub inspection_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InspectionPhotoPath {
    pub inspection_id: String,
    pub photo_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContractPath {
    pub contract_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvoicePath {
    pub invoice_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicOrgPath {
    pub org_slug: String,
}

// ── Organizations ───────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateOrganizationInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub org_slug: Option<String>,
    pub legal_name: Option<String>,
    pub tax_id: Option<String>,
    pub address: Option<String>,
    pub timezone: Option<String>,
    #[serde(default = "default_currency_eur")]
    #[validate(length(equal = 3))]
    pub currency: String,
    #[validate(email)]
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub default_locale: Option<String>,
    #[validate(url)]
    pub review_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateOrganizationInput {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub org_slug: Option<String>,
    pub legal_name: Option<String>,
    pub tax_id: Option<String>,
    pub address: Option<String>,
    pub timezone: Option<String>,
    #[validate(length(equal = 3))]
    pub currency: Option<String>,
    pub booking_widget_enabled: Option<bool>,
    #[validate(email)]
    pub contact_email: Option<String>,
    pub contact_phone: Option<String>,
    pub default_locale: Option<String>,
    #[validate(url)]
    pub review_url: Option<String>,
}

// ── Customers ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CustomersQuery {
    pub org_id: String,
    pub search: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateCustomerInput {
    pub organization_id: String,
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(min = 6, max = 20))]
    pub phone_e164: Option<String>,
    pub national_id: Option<String>,
    pub passport_number: Option<String>,
    pub driver_license_number: Option<String>,
    pub driver_license_expiry: Option<NaiveDate>,
    pub birth_date: Option<NaiveDate>,
    pub address_line: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    #[validate(length(equal = 2))]
    pub country_code: Option<String>,
    #[validate(length(min = 2, max = 5))]
    pub preferred_language: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateCustomerInput {
    #[validate(length(min = 1, max = 255))]
    pub full_name: Option<String>,
    #[validate(email)]
    pub email: Option<String>,
    #[validate(length(min = 6, max = 20))]
    pub phone_e164: Option<String>,
    pub national_id: Option<String>,
    pub passport_number: Option<String>,
    pub driver_license_number: Option<String>,
    pub driver_license_expiry: Option<NaiveDate>,
    pub birth_date: Option<NaiveDate>,
    pub address_line: Option<String>,
    pub city: Option<String>,
    pub postal_code: Option<String>,
    #[validate(length(equal = 2))]
    pub country_code: Option<String>,
    #[validate(length(min = 2, max = 5))]
    pub preferred_language: Option<String>,
    pub notes: Option<String>,
}

// ── Vehicles ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleType {
    #[default]
    Scooter,
    Car,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipType {
    #[default]
    Owned,
    Leased,
    Renting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleDocumentType {
    RegistrationCertificate,
    InsurancePolicy,
    ItvCertificate,
    Other,
}

impl VehicleDocumentType {
    pub fn parse(raw: &str) -> Option<Self> {
        serde_json::from_value(Value::String(raw.trim().to_ascii_lowercase())).ok()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RegistrationCertificate => "registration_certificate",
            Self::InsurancePolicy => "insurance_policy",
            Self::ItvCertificate => "itv_certificate",
            Self::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VehiclesQuery {
    pub org_id: String,
    pub status: Option<VehicleStatus>,
    pub vehicle_type: Option<VehicleType>,
    pub vehicle_group: Option<String>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrgQuery {
    pub org_id: String,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateVehicleInput {
    pub organization_id: String,
    #[validate(length(min = 1, max = 20))]
    pub registration: String,
    pub brand: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub vehicle_type: VehicleType,
    #[validate(length(min = 1, max = 64))]
    pub vehicle_group: Option<String>,
    #[serde(default = "default_vehicle_status")]
    pub status: VehicleStatus,
    #[validate(range(min = 1950, max = 2100))]
    pub year: Option<i32>,
    pub color: Option<String>,
    #[validate(range(min = 0))]
    pub odometer_km: Option<i64>,
    pub insurance_company: Option<String>,
    pub insurance_policy: Option<String>,
    pub insurance_expiry: Option<NaiveDate>,
    pub itv_expiry: Option<NaiveDate>,
    #[serde(default)]
    pub ownership_type: OwnershipType,
    pub notes: Option<String>,
}

fn default_vehicle_status() -> VehicleStatus {
    VehicleStatus::Active
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateVehicleInput {
    #[validate(length(min = 1, max = 20))]
    pub registration: Option<String>,
    pub brand: Option<String>,
    pub model: Option<String>,
    pub vehicle_type: Option<VehicleType>,
    #[validate(length(min = 1, max = 64))]
    pub vehicle_group: Option<String>,
    pub status: Option<VehicleStatus>,
    #[validate(range(min = 1950, max = 2100))]
    pub year: Option<i32>,
    pub color: Option<String>,
    #[validate(range(min = 0))]
    pub odometer_km: Option<i64>,
    pub insurance_company: Option<String>,
    pub insurance_policy: Option<String>,
    pub insurance_expiry: Option<NaiveDate>,
    pub itv_expiry: Option<NaiveDate>,
    pub ownership_type: Option<OwnershipType>,
    pub notes: Option<String>,
}

// ── Maintenance ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceQuery {
    pub org_id: String,
    pub vehicle_id: Option<String>,
    pub status: Option<MaintenanceStatus>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateMaintenanceInput {
    pub organization_id: String,
    pub vehicle_id: String,
    pub service_date: NaiveDate,
    #[serde(default = "default_maintenance_kind")]
    pub kind: MaintenanceKind,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    #[validate(range(min = 0))]
    pub odometer_km: Option<i64>,
    pub workshop: Option<String>,
    #[serde(default = "default_maintenance_status")]
    pub status: MaintenanceStatus,
}

fn default_maintenance_kind() -> MaintenanceKind {
    MaintenanceKind::Service
}
fn default_maintenance_status() -> MaintenanceStatus {
    MaintenanceStatus::Scheduled
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateMaintenanceInput {
    pub service_date: Option<NaiveDate>,
    pub kind: Option<MaintenanceKind>,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    #[validate(range(min = 0))]
    pub odometer_km: Option<i64>,
    pub workshop: Option<String>,
    pub status: Option<MaintenanceStatus>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateExpenseInput {
    #[validate(length(min = 1, max = 255))]
    pub concept: String,
    #[validate(range(min = 0.0))]
    pub amount: f64,
    pub payer: ExpensePayer,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateExpenseInput {
    #[validate(length(min = 1, max = 255))]
    pub concept: Option<String>,
    #[validate(range(min = 0.0))]
    pub amount: Option<f64>,
    pub payer: Option<ExpensePayer>,
    pub notes: Option<String>,
}

// ── Pricing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreatePricingGroupInput {
    pub organization_id: String,
    #[validate(length(min = 1, max = 64))]
    pub vehicle_group: String,
    pub tiers: Vec<PriceTier>,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub extra_day_price: f64,
    #[serde(default)]
    #[validate(range(min = 0.0))]
    pub insurance_per_day: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdatePricingGroupInput {
    #[validate(length(min = 1, max = 64))]
    pub vehicle_group: Option<String>,
    pub tiers: Option<Vec<PriceTier>>,
    #[validate(range(min = 0.0))]
    pub extra_day_price: Option<f64>,
    #[validate(range(min = 0.0))]
    pub insurance_per_day: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtrasQuery {
    pub org_id: String,
    pub kind: Option<ExtraKind>,
    pub active: Option<bool>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateExtraInput {
    pub organization_id: String,
    pub kind: ExtraKind,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(range(min = 0.0))]
    pub unit_price: f64,
    pub price_type: PriceType,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateExtraInput {
    pub kind: Option<ExtraKind>,
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    #[validate(range(min = 0.0))]
    pub unit_price: Option<f64>,
    pub price_type: Option<PriceType>,
    pub is_active: Option<bool>,
}

/// A catalog extra or upgrade picked for a booking.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LineSelection {
    pub extra_id: String,
    #[serde(default = "default_quantity")]
    #[validate(range(min = 1, max = 20))]
    pub quantity: u32,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct QuoteInput {
    pub org_id: String,
    #[validate(length(min = 1, max = 10))]
    pub vehicle_ids: Vec<String>,
    pub pickup_at: DateTime<Utc>,
    pub return_at: DateTime<Utc>,
    #[serde(default)]
    #[validate(nested)]
    pub extras: Vec<LineSelection>,
    #[serde(default)]
    #[validate(nested)]
    pub upgrades: Vec<LineSelection>,
    #[serde(default)]
    pub include_insurance: bool,
    pub discount_type: Option<DiscountType>,
    #[validate(range(min = 0.0))]
    pub discount_value: Option<f64>,
}

impl QuoteInput {
    pub fn discount(&self) -> Option<Discount> {
        discount_from(self.discount_type, self.discount_value)
    }
}

// ── Availability ────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct AvailabilityQuery {
    pub org_id: String,
    pub pickup_at: DateTime<Utc>,
    pub return_at: DateTime<Utc>,
    pub vehicle_type: Option<VehicleType>,
    pub exclude_booking_id: Option<String>,
}

// ── Bookings ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct BookingsQuery {
    pub org_id: String,
    pub status: Option<BookingStatus>,
    pub customer_id: Option<String>,
    pub vehicle_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBookingInput {
    pub organization_id: String,
    pub customer_id: String,
    #[validate(length(min = 1, max = 10))]
    pub vehicle_ids: Vec<String>,
    pub pickup_at: DateTime<Utc>,
    pub return_at: DateTime<Utc>,
    #[serde(default)]
    #[validate(nested)]
    pub extras: Vec<LineSelection>,
    #[serde(default)]
    #[validate(nested)]
    pub upgrades: Vec<LineSelection>,
    #[serde(default)]
    #[validate(length(max = 5))]
    pub additional_drivers: Vec<AdditionalDriver>,
    #[serde(default)]
    pub include_insurance: bool,
    pub discount_type: Option<DiscountType>,
    #[validate(range(min = 0.0))]
    pub discount_value: Option<f64>,
    pub status: Option<BookingStatus>,
    #[validate(range(min = 0.0))]
    pub total_price_override: Option<f64>,
    pub pickup_location: Option<String>,
    pub return_location: Option<String>,
    #[validate(length(max = 4000))]
    pub notes: Option<String>,
}

impl CreateBookingInput {
    pub fn discount(&self) -> Option<Discount> {
        discount_from(self.discount_type, self.discount_value)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateBookingInput {
    pub customer_id: Option<String>,
    #[validate(length(min = 1, max = 10))]
    pub vehicle_ids: Option<Vec<String>>,
    pub pickup_at: Option<DateTime<Utc>>,
    pub return_at: Option<DateTime<Utc>>,
    #[validate(nested)]
    pub extras: Option<Vec<LineSelection>>,
    #[validate(nested)]
    pub upgrades: Option<Vec<LineSelection>>,
    #[validate(length(max = 5))]
    pub additional_drivers: Option<Vec<AdditionalDriver>>,
    pub include_insurance: Option<bool>,
    pub discount_type: Option<DiscountType>,
    #[validate(range(min = 0.0))]
    pub discount_value: Option<f64>,
    #[validate(range(min = 0.0))]
    pub total_price_override: Option<f64>,
    pub pickup_location: Option<String>,
    pub return_location: Option<String>,
    #[validate(length(max = 4000))]
    pub notes: Option<String>,
}

impl UpdateBookingInput {
    /// Whether the edit changes anything that feeds the price.
    pub fn touches_price(&self) -> bool {
        self.vehicle_ids.is_some()
            || self.pickup_at.is_some()
            || self.return_at.is_some()
            || self.extras.is_some()
            || self.upgrades.is_some()
            || self.include_insurance.is_some()
            || self.discount_type.is_some()
            || self.discount_value.is_some()
            || self.total_price_override.is_some()
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct BookingStatusInput {
    pub status: BookingStatus,
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CompleteBookingInput {
    #[serde(default, rename = "override")]
    pub override_gate: bool,
    #[validate(length(max = 1000))]
    pub override_reason: Option<String>,
    #[serde(default = "default_true")]
    pub send_review_request: bool,
}

// ── Payments & deposits ─────────────────────────────────────────────

/// At least one cent once rounded to the stored precision.
fn positive_money(amount: f64) -> Result<(), ValidationError> {
    if to_cents(amount) > 0 {
        Ok(())
    } else {
        Err(ValidationError::new("positive_money"))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreatePaymentInput {
    #[validate(length(max = 255))]
    pub concept: Option<String>,
    #[validate(custom(function = "positive_money"))]
    pub amount: f64,
    pub method: PaymentMethod,
    pub paid_at: Option<DateTime<Utc>>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateDepositInput {
    #[validate(custom(function = "positive_money"))]
    pub amount: f64,
    pub payment_method: PaymentMethod,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct UpdateDepositInput {
    pub status: Option<DepositStatus>,
    pub returned_amount: Option<f64>,
    pub withheld_amount: Option<f64>,
    pub withheld_damages: Option<f64>,
    pub withheld_fines: Option<f64>,
    pub withheld_extension: Option<f64>,
    pub withheld_other: Option<f64>,
    pub return_method: Option<PaymentMethod>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
    #[serde(default, rename = "override")]
    pub override_gate: bool,
    #[validate(length(max = 1000))]
    pub override_reason: Option<String>,
}

// ── Inspections ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct InspectionsQuery {
    pub org_id: Option<String>,
    pub booking_id: Option<String>,
    pub vehicle_id: Option<String>,
    pub kind: Option<InspectionKind>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateInspectionInput {
    pub booking_id: String,
    pub vehicle_id: String,
    pub kind: InspectionKind,
    #[validate(range(min = 0))]
    pub odometer_km: Option<i64>,
    #[validate(range(min = 0, max = 100))]
    pub fuel_level: Option<i32>,
    #[validate(length(max = 4000))]
    pub notes: Option<String>,
    #[serde(default)]
    #[validate(length(max = 100))]
    pub damages: Vec<Damage>,
    pub inspected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateInspectionInput {
    #[validate(range(min = 0))]
    pub odometer_km: Option<i64>,
    #[validate(range(min = 0, max = 100))]
    pub fuel_level: Option<i32>,
    #[validate(length(max = 4000))]
    pub notes: Option<String>,
    #[validate(length(max = 100))]
    pub damages: Option<Vec<Damage>>,
    pub inspected_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct SendDocumentInput {
    #[validate(email)]
    pub recipient: Option<String>,
}

// ── Contracts ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SignContractInput {
    #[validate(length(min = 1, max = 255))]
    pub signer_name: String,
    pub signature_png_base64: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SigningLinkInput {
    #[serde(default = "default_signing_hours")]
    #[validate(range(min = 1, max = 720))]
    pub expires_in_hours: i64,
}

impl Default for SigningLinkInput {
    fn default() -> Self {
        Self {
            expires_in_hours: default_signing_hours(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PublicSignInput {
    #[validate(length(min = 32, max = 128))]
    pub token: String,
    #[validate(length(min = 1, max = 255))]
    pub signer_name: String,
    #[validate(length(min = 1))]
    pub signature_png_base64: String,
}

// ── Invoices ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct InvoicesQuery {
    pub org_id: String,
    pub booking_id: Option<String>,
    pub kind: Option<InvoiceKind>,
    #[serde(default = "default_limit_200")]
    pub limit: i64,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct VoidInvoiceInput {
    #[validate(length(max = 1000))]
    pub reason: Option<String>,
}

// ── Public booking widget ───────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct PublicAvailabilityQuery {
    pub pickup_at: DateTime<Utc>,
    pub return_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PublicQuoteInput {
    #[validate(length(min = 1, max = 64))]
    pub vehicle_group: String,
    pub pickup_at: DateTime<Utc>,
    pub return_at: DateTime<Utc>,
    #[serde(default)]
    #[validate(nested)]
    pub extras: Vec<LineSelection>,
    #[serde(default)]
    #[validate(nested)]
    pub upgrades: Vec<LineSelection>,
    #[serde(default)]
    pub include_insurance: bool,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PublicReserveInput {
    #[validate(nested)]
    #[serde(flatten)]
    pub quote: PublicQuoteInput,
    #[validate(length(min = 1, max = 255))]
    pub full_name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 6, max = 20))]
    pub phone_e164: Option<String>,
    #[validate(length(min = 2, max = 5))]
    pub preferred_language: Option<String>,
    #[validate(length(max = 2000))]
    pub notes: Option<String>,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        check_slug, check_tiers, remove_nulls, serialize_to_map, validate_input,
        CompleteBookingInput, CreateBookingInput, CreateCustomerInput, CreateDepositInput,
        CreatePaymentInput, UpdateBookingInput, VehicleDocumentType,
    };
    use crate::models::{DiscountType, PriceTier};

    #[test]
    fn payment_amount_must_be_positive() {
        let payment: CreatePaymentInput =
            serde_json::from_value(json!({ "amount": 0, "method": "cash" })).expect("payload");
        assert!(validate_input(&payment).is_err());

        let payment: CreatePaymentInput =
            serde_json::from_value(json!({ "amount": 12.5, "method": "card_terminal" }))
                .expect("payload");
        assert!(validate_input(&payment).is_ok());

        let payment: CreatePaymentInput =
            serde_json::from_value(json!({ "amount": 0.001, "method": "cash" })).expect("payload");
        assert!(validate_input(&payment).is_err());

        let deposit: CreateDepositInput =
            serde_json::from_value(json!({ "amount": 0.004, "payment_method": "cash" })).expect("payload");
        assert!(validate_input(&deposit).is_err());

        assert!(serde_json::from_value::<CreatePaymentInput>(
            json!({ "amount": 10, "method": "bitcoin" })
        )
        .is_err());
    }

    #[test]
    fn customer_email_is_validated_and_nulls_dropped() {
        let input: CreateCustomerInput = serde_json::from_value(json!({
            "organization_id": "o1",
            "full_name": "Ana Ruiz",
            "email": "not-an-email",
        }))
        .expect("payload");
        assert!(validate_input(&input).is_err());

        let input = CreateCustomerInput {
            email: Some("ana@example.com".to_string()),
            ..input
        };
        assert!(validate_input(&input).is_ok());
        let record = remove_nulls(serialize_to_map(&input));
        assert_eq!(record["full_name"], "Ana Ruiz");
        assert!(!record.contains_key("passport_number"));
    }

    #[test]
    fn booking_discount_needs_type_and_positive_value() {
        let input: CreateBookingInput = serde_json::from_value(json!({
            "organization_id": "o1",
            "customer_id": "c1",
            "vehicle_ids": ["v1"],
            "pickup_at": "2026-07-01T10:00:00Z",
            "return_at": "2026-07-02T10:00:00Z",
            "discount_type": "percentage",
            "discount_value": 10,
            "extras": [{ "extra_id": "e1" }],
        }))
        .expect("payload");
        assert!(validate_input(&input).is_ok());
        assert_eq!(input.extras[0].quantity, 1);
        let discount = input.discount().expect("discount");
        assert_eq!(discount.kind, DiscountType::Percentage);

        let no_value = CreateBookingInput {
            discount_value: Some(0.0),
            ..input
        };
        assert!(no_value.discount().is_none());
    }

    #[test]
    fn booking_update_detects_price_relevant_edits() {
        assert!(!UpdateBookingInput {
            notes: Some("late arrival".to_string()),
            ..UpdateBookingInput::default()
        }
        .touches_price());
        assert!(UpdateBookingInput {
            include_insurance: Some(true),
            ..UpdateBookingInput::default()
        }
        .touches_price());
    }

    #[test]
    fn completion_override_uses_the_override_key() {
        let input: CompleteBookingInput =
            serde_json::from_value(json!({ "override": true, "override_reason": "known customer" }))
                .expect("payload");
        assert!(input.override_gate);
        assert!(input.send_review_request);
    }

    #[test]
    fn tier_and_slug_rules() {
        let tier = |days, price| PriceTier { days, price };
        assert!(check_tiers(&[tier(1, 30.0), tier(3, 80.0)]).is_ok());
        assert!(check_tiers(&[]).is_err());
        assert!(check_tiers(&[tier(1, 30.0), tier(1, 25.0)]).is_err());
        assert!(check_tiers(&[tier(0, 30.0)]).is_err());

        assert!(check_slug(Some("moto-sol")).is_ok());
        assert!(check_slug(Some("Moto Sol")).is_err());
        assert!(check_slug(None).is_ok());
    }

    #[test]
    fn vehicle_document_types_parse() {
        assert_eq!(
            VehicleDocumentType::parse(" ITV_certificate "),
            Some(VehicleDocumentType::ItvCertificate)
        );
        assert_eq!(VehicleDocumentType::parse("photo"), None);
    }
}
