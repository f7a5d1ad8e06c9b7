use std::collections::HashSet;

use chrono::NaiveDate;
use serde::Serialize;
use serde_json::{json, Value};

use crate::models::{Customer, CustomerDocumentType};

pub const MISSING_IDENTITY_DOCUMENT: &str = "identity_document";
pub const MISSING_LICENSE_FRONT: &str = "driver_license_front";
pub const MISSING_LICENSE_BACK: &str = "driver_license_back";

/// Document images a customer needs before a rental can be closed:
/// (ID front + back) or passport, plus both sides of the driver license.
pub fn missing_documents(present: &HashSet<CustomerDocumentType>) -> Vec<&'static str> {
    let mut missing = Vec::new();
    let has_id_card = present.contains(&CustomerDocumentType::IdFront)
        && present.contains(&CustomerDocumentType::IdBack);
    if !has_id_card && !present.contains(&CustomerDocumentType::Passport) {
        missing.push(MISSING_IDENTITY_DOCUMENT);
    }
    if !present.contains(&CustomerDocumentType::DriverLicenseFront) {
        missing.push(MISSING_LICENSE_FRONT);
    }
    if !present.contains(&CustomerDocumentType::DriverLicenseBack) {
        missing.push(MISSING_LICENSE_BACK);
    }
    missing
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |text| text.trim().is_empty())
}

pub fn missing_fields(customer: &Customer, today: NaiveDate) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if customer.full_name.trim().is_empty() {
        missing.push("full_name");
    }
    if is_blank(customer.phone_e164.as_deref()) && is_blank(customer.email.as_deref()) {
        missing.push("contact");
    }
    if is_blank(customer.national_id.as_deref()) && is_blank(customer.passport_number.as_deref()) {
        missing.push("identity_number");
    }
    if is_blank(customer.driver_license_number.as_deref()) {
        missing.push("driver_license_number");
    }
    match customer.driver_license_expiry {
        None => missing.push("driver_license_expiry"),
        Some(expiry) if expiry < today => missing.push("driver_license_expired"),
        Some(_) => {}
    }
    if is_blank(customer.address_line.as_deref()) {
        missing.push("address");
    }
    missing
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Completeness {
    pub is_complete: bool,
    pub missing_items: Vec<&'static str>,
}

pub fn completeness(
    customer: &Customer,
    documents: &HashSet<CustomerDocumentType>,
    today: NaiveDate,
) -> Completeness {
    let mut missing_items = missing_fields(customer, today);
    missing_items.extend(missing_documents(documents));
    Completeness {
        is_complete: missing_items.is_empty(),
        missing_items,
    }
}

/// Adds `is_complete`, `missing_items` and `documents` to a customer row.
pub fn decorate_customer(
    mut row: Value,
    customer: &Customer,
    documents: Vec<Value>,
    present: &HashSet<CustomerDocumentType>,
    today: NaiveDate,
) -> Value {
    let report = completeness(customer, present, today);
    if let Some(object) = row.as_object_mut() {
        object.insert("is_complete".to_string(), json!(report.is_complete));
        object.insert("missing_items".to_string(), json!(report.missing_items));
        object.insert("documents".to_string(), Value::Array(documents));
    }
    row
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::NaiveDate;

    use super::{completeness, missing_documents, missing_fields, MISSING_IDENTITY_DOCUMENT};
    use crate::models::{Customer, CustomerDocumentType as Doc};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 7, 1).unwrap()
    }

    fn customer() -> Customer {
        Customer {
            id: "c".to_string(),
            organization_id: "o".to_string(),
            full_name: "Ana García".to_string(),
            email: Some("ana@example.com".to_string()),
            phone_e164: Some("+34600111222".to_string()),
            national_id: Some("12345678Z".to_string()),
            passport_number: None,
            driver_license_number: Some("B-998877".to_string()),
            driver_license_expiry: NaiveDate::from_ymd_opt(2030, 1, 1),
            address_line: Some("Calle Mayor 1".to_string()),
            city: None,
            postal_code: None,
            country_code: None,
            preferred_language: Some("es".to_string()),
        }
    }

    #[test]
    fn identity_item_is_independent_of_license() {
        let license_only: HashSet<_> = [Doc::DriverLicenseFront, Doc::DriverLicenseBack].into();
        assert_eq!(missing_documents(&license_only), vec![MISSING_IDENTITY_DOCUMENT]);

        let nothing = HashSet::new();
        assert!(missing_documents(&nothing).contains(&MISSING_IDENTITY_DOCUMENT));

        let half_id: HashSet<_> = [Doc::IdFront].into();
        assert!(missing_documents(&half_id).contains(&MISSING_IDENTITY_DOCUMENT));
    }

    #[test]
    fn passport_or_full_id_card_satisfies_identity() {
        let passport: HashSet<_> = [Doc::Passport, Doc::DriverLicenseFront, Doc::DriverLicenseBack].into();
        assert!(missing_documents(&passport).is_empty());
        let id_card: HashSet<_> = [Doc::IdFront, Doc::IdBack, Doc::DriverLicenseFront].into();
        assert_eq!(missing_documents(&id_card), vec!["driver_license_back"]);
    }

    #[test]
    fn expired_license_is_reported() {
        let mut expired = customer();
        expired.driver_license_expiry = NaiveDate::from_ymd_opt(2026, 6, 30);
        assert_eq!(missing_fields(&expired, today()), vec!["driver_license_expired"]);
    }

    #[test]
    fn complete_customer() {
        let docs: HashSet<_> = [Doc::Passport, Doc::DriverLicenseFront, Doc::DriverLicenseBack].into();
        let report = completeness(&customer(), &docs, today());
        assert!(report.is_complete, "{:?}", report.missing_items);
    }
}
