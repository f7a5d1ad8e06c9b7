use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Datelike, Utc};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use sqlx::PgConnection;

use crate::{
    error::AppError,
    models::{Booking, Contract},
    repository::table_service::{create_row, list_rows},
    services::{
        booking_data::{load_booking, load_booking_vehicles, load_customer, load_deposits, load_organization},
        document_numbers::{next_document_number, CONTRACT_PREFIX},
        money::{from_cents, sum_cents},
        pricing::apply_discount,
        storage::fetch_as_data_uri,
        templates::{format_local, parse_timezone, render_contract_html, ContractLine, ContractView},
    },
    state::AppState,
};

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const MAX_SIGNATURE_BYTES: usize = 512 * 1024;

/// Returns the booking's contract, creating a numbered one when absent.
pub async fn ensure_contract_tx(
    conn: &mut PgConnection,
    booking: &Booking,
    now: DateTime<Utc>,
) -> Result<Value, AppError> {
    let mut filters = Map::new();
    filters.insert("booking_id".to_string(), json!(booking.id));
    let existing = list_rows(&mut *conn, "contracts", Some(&filters), 1, 0, "created_at", true).await?;
    if let Some(contract) = existing.into_iter().next() {
        return Ok(contract);
    }

    let number = next_document_number(conn, &booking.organization_id, CONTRACT_PREFIX, now.year()).await?;
    let mut record = Map::new();
    record.insert("organization_id".to_string(), json!(booking.organization_id));
    record.insert("booking_id".to_string(), json!(booking.id));
    record.insert("contract_number".to_string(), json!(number));
    let created = create_row(&mut *conn, "contracts", &record).await?;
    tracing::info!(booking_id = %booking.id, contract_number = %number, "Contract created");
    Ok(created)
}

pub fn hash_signing_token(token: &str) -> String {
    let digest = Sha256::digest(token.trim().as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// A random one-time token and the hash that gets stored.
pub fn issue_signing_token() -> (String, String) {
    let token = format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    );
    let hash = hash_signing_token(&token);
    (token, hash)
}

/// Decodes a base64 PNG (optionally a `data:image/png;base64,` URI).
pub fn decode_signature_png(raw: &str) -> Result<Vec<u8>, AppError> {
    let payload = raw
        .trim()
        .strip_prefix("data:image/png;base64,")
        .unwrap_or_else(|| raw.trim());
    let bytes = STANDARD
        .decode(payload)
        .map_err(|_| AppError::BadRequest("signature_png_base64 is not valid base64.".to_string()))?;
    if !bytes.starts_with(PNG_MAGIC) {
        return Err(AppError::BadRequest("Signature must be a PNG image.".to_string()));
    }
    if bytes.len() > MAX_SIGNATURE_BYTES {
        return Err(AppError::BadRequest("Signature image is too large.".to_string()));
    }
    Ok(bytes)
}

/// Stores the signature image and returns the patch that marks the contract signed.
pub async fn signature_patch(
    state: &AppState,
    contract: &Contract,
    signer_name: &str,
    signature_png: Option<Vec<u8>>,
    signed_by_user_id: Option<&str>,
) -> Result<Map<String, Value>, AppError> {
    if contract.signed_at.is_some() {
        return Err(AppError::Conflict("Contract is already signed.".to_string()));
    }
    let signer_name = signer_name.trim();
    if signer_name.is_empty() {
        return Err(AppError::BadRequest("signer_name is required.".to_string()));
    }

    let mut patch = Map::new();
    if let Some(png) = signature_png {
        let key = format!(
            "{}/contracts/{}/signature-{}.png",
            contract.organization_id,
            contract.id,
            uuid::Uuid::new_v4().simple()
        );
        state.storage.put(&key, png, "image/png").await?;
        patch.insert("signature_key".to_string(), json!(key));
    }
    patch.insert("signer_name".to_string(), json!(signer_name));
    patch.insert("signed_at".to_string(), json!(Utc::now().to_rfc3339()));
    patch.insert("signing_token_hash".to_string(), Value::Null);
    patch.insert("signing_token_expires_at".to_string(), Value::Null);
    if let Some(user_id) = signed_by_user_id {
        patch.insert("signed_by_user_id".to_string(), json!(user_id));
    }
    Ok(patch)
}

/// Gathers the booking, customer, vehicles and deposits into a contract view.
pub async fn build_contract_view(
    state: &AppState,
    conn: &mut PgConnection,
    contract: &Contract,
) -> Result<(ContractView, Booking), AppError> {
    let (_, booking) = load_booking(conn, &contract.booking_id).await?;
    let organization = load_organization(conn, &contract.organization_id).await?;
    let customer = load_customer(conn, &booking.customer_id).await?;
    let vehicles = load_booking_vehicles(conn, &booking.id).await?;
    let deposits = load_deposits(conn, &booking.id).await?;
    let timezone = parse_timezone(organization.timezone.as_deref(), &state.config.default_timezone);

    let mut lines = vehicles
        .iter()
        .map(|(vehicle, price)| ContractLine {
            description: format!("Rental {}", vehicle.display_name()),
            amount: *price,
        })
        .collect::<Vec<_>>();
    lines.extend(
        booking
            .extras
            .iter()
            .chain(booking.upgrades.iter())
            .map(|line| ContractLine {
                description: if line.quantity > 1 {
                    format!("{} × {}", line.name, line.quantity)
                } else {
                    line.name.clone()
                },
                amount: line.total_price,
            }),
    );
    let subtotal = from_cents(sum_cents(lines.iter().map(|line| line.amount)));
    let (discount_amount, _) = apply_discount(subtotal, booking.discount());

    let signature_data_uri = match contract.signature_key.as_deref() {
        Some(key) => match fetch_as_data_uri(state.storage.as_ref(), &state.http_client, key, Some("image/png")).await {
            Ok(uri) => Some(uri),
            Err(error) => {
                tracing::warn!(contract_id = %contract.id, error = %error, "Signature image unavailable");
                None
            }
        },
        None => None,
    };

    let deposit_total = sum_cents(deposits.iter().map(|deposit| deposit.amount));
    let view = ContractView {
        contract_number: contract.contract_number.clone(),
        organization_name: organization.name.clone(),
        organization_legal_name: organization.legal_name.clone(),
        organization_tax_id: organization.tax_id.clone(),
        organization_address: organization.address.clone(),
        customer_name: customer.full_name.clone(),
        customer_identity: customer.national_id.clone().or(customer.passport_number.clone()),
        customer_license: customer.driver_license_number.clone().map(|number| {
            match customer.driver_license_expiry {
                Some(expiry) => format!("{number} (valid until {})", expiry.format("%d/%m/%Y")),
                None => number,
            }
        }),
        customer_address: [
            customer.address_line.as_deref(),
            customer.postal_code.as_deref(),
            customer.city.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|part| !part.trim().is_empty())
        .collect::<Vec<_>>()
        .join(", ")
        .into(),
        additional_drivers: booking
            .additional_drivers
            .iter()
            .map(|driver| match &driver.driver_license_number {
                Some(license) => format!("{} ({license})", driver.full_name),
                None => driver.full_name.clone(),
            })
            .collect(),
        pickup_at: format_local(booking.pickup_at, timezone),
        return_at: format_local(booking.return_at, timezone),
        pickup_location: booking.pickup_location.clone(),
        return_location: booking.return_location.clone(),
        lines,
        discount_amount,
        total_price: booking.total_price,
        deposit_amount: (deposit_total > 0).then(|| from_cents(deposit_total)),
        signer_name: contract.signer_name.clone(),
        signed_at: contract.signed_at.map(|at| format_local(at, timezone)),
        signature_data_uri,
    };
    Ok((view, booking))
}

pub async fn render_contract_pdf(
    state: &AppState,
    conn: &mut PgConnection,
    contract: &Contract,
) -> Result<(Vec<u8>, Booking), AppError> {
    let (view, booking) = build_contract_view(state, conn, contract).await?;
    let html = render_contract_html(&view);
    let pdf = state.pdf_renderer.render(&html).await?;
    Ok((pdf, booking))
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    use super::{decode_signature_png, hash_signing_token, issue_signing_token, PNG_MAGIC};

    #[test]
    fn tokens_are_hashed_with_sha256() {
        assert_eq!(
            hash_signing_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        let (token, hash) = issue_signing_token();
        assert_eq!(token.len(), 64);
        assert_eq!(hash_signing_token(&token), hash);
        assert_ne!(token, hash);
    }

    #[test]
    fn accepts_png_payloads_only() {
        let mut png = PNG_MAGIC.to_vec();
        png.extend_from_slice(&[0, 0, 0, 13]);
        let encoded = STANDARD.encode(&png);
        assert_eq!(decode_signature_png(&encoded).expect("png"), png);
        assert!(decode_signature_png(&format!("data:image/png;base64,{encoded}")).is_ok());
        assert!(decode_signature_png(&STANDARD.encode(b"GIF89a")).is_err());
        assert!(decode_signature_png("%%%").is_err());
    }
}
