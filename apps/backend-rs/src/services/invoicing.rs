use chrono::{DateTime, Datelike, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::PgConnection;

use crate::{
    error::AppError,
    models::{Booking, InvoiceKind, Payment, Vehicle},
    repository::table_service::{create_row, list_rows},
    services::{
        document_numbers::next_document_number,
        money::{from_cents, round_money, sum_cents, to_cents},
        pricing::apply_discount,
    },
};

/// Cash majority by amount → ticket; anything else, ties included → invoice.
pub fn invoice_kind_for(payments: &[Payment]) -> InvoiceKind {
    let cash = sum_cents(
        payments
            .iter()
            .filter(|payment| payment.method.is_cash())
            .map(|payment| payment.amount),
    );
    let other = sum_cents(
        payments
            .iter()
            .filter(|payment| !payment.method.is_cash())
            .map(|payment| payment.amount),
    );
    if cash > other {
        InvoiceKind::Ticket
    } else {
        InvoiceKind::Invoice
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaxSplit {
    pub base: f64,
    pub tax_rate: f64,
    pub tax_amount: f64,
    pub total: f64,
}

/// Extracts VAT from a tax-inclusive total.
pub fn split_vat(total: f64, rate_percent: f64) -> TaxSplit {
    let total_cents = to_cents(total);
    let base_cents = (total_cents as f64 / (1.0 + rate_percent / 100.0)).round() as i64;
    TaxSplit {
        base: from_cents(base_cents),
        tax_rate: rate_percent,
        tax_amount: from_cents(total_cents - base_cents),
        total: from_cents(total_cents),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InvoiceLine {
    pub description: String,
    pub quantity: u32,
    pub unit_price: f64,
    pub total: f64,
}

/// Vehicles, extras, upgrades and the discount as invoice lines, plus an
/// adjustment line when the booking total was set by hand.
pub fn build_invoice_lines(booking: &Booking, vehicles: &[(Vehicle, f64)]) -> Vec<InvoiceLine> {
    let mut lines = vehicles
        .iter()
        .map(|(vehicle, price)| InvoiceLine {
            description: format!("Rental {}", vehicle.display_name()),
            quantity: 1,
            unit_price: round_money(*price),
            total: round_money(*price),
        })
        .collect::<Vec<_>>();

    for line in booking.extras.iter().chain(booking.upgrades.iter()) {
        lines.push(InvoiceLine {
            description: line.name.clone(),
            quantity: line.quantity.max(1),
            unit_price: round_money(line.unit_price),
            total: round_money(line.total_price),
        });
    }

    let subtotal = from_cents(sum_cents(lines.iter().map(|line| line.total)));
    let (discount_amount, _) = apply_discount(subtotal, booking.discount());
    if discount_amount > 0.0 {
        lines.push(InvoiceLine {
            description: "Discount".to_string(),
            quantity: 1,
            unit_price: -discount_amount,
            total: -discount_amount,
        });
    }

    // Overridden totals still have to add up on paper.
    let difference = to_cents(booking.total_price) - sum_cents(lines.iter().map(|line| line.total));
    if difference != 0 {
        lines.push(InvoiceLine {
            description: "Adjustment".to_string(),
            quantity: 1,
            unit_price: from_cents(difference),
            total: from_cents(difference),
        });
    }
    lines
}

pub struct InvoiceDraft<'a> {
    pub booking: &'a Booking,
    pub vehicles: &'a [(Vehicle, f64)],
    pub payments: &'a [Payment],
    pub vat_rate_percent: f64,
    pub issued_at: DateTime<Utc>,
}

/// Inserts a numbered invoice or ticket inside the caller's transaction.
pub async fn create_invoice_tx(
    conn: &mut PgConnection,
    draft: InvoiceDraft<'_>,
) -> Result<Value, AppError> {
    let booking = draft.booking;
    let kind = invoice_kind_for(draft.payments);
    let number = next_document_number(
        conn,
        &booking.organization_id,
        kind.number_prefix(),
        draft.issued_at.year(),
    )
    .await?;
    let tax = split_vat(booking.total_price, draft.vat_rate_percent);
    let lines = build_invoice_lines(booking, draft.vehicles);

    let mut by_method = Map::new();
    for payment in draft.payments {
        let entry = by_method
            .entry(payment.method.as_str().to_string())
            .or_insert_with(|| json!(0.0));
        let current = entry.as_f64().unwrap_or_default();
        *entry = json!(round_money(current + payment.amount));
    }

    let mut record = Map::new();
    record.insert("organization_id".to_string(), json!(booking.organization_id));
    record.insert("booking_id".to_string(), json!(booking.id));
    record.insert("customer_id".to_string(), json!(booking.customer_id));
    record.insert("kind".to_string(), json!(kind.as_str()));
    record.insert("number".to_string(), json!(number));
    record.insert("issued_at".to_string(), json!(draft.issued_at.to_rfc3339()));
    record.insert("lines".to_string(), json!(lines));
    record.insert("base_amount".to_string(), json!(tax.base));
    record.insert("tax_rate".to_string(), json!(tax.tax_rate));
    record.insert("tax_amount".to_string(), json!(tax.tax_amount));
    record.insert("total".to_string(), json!(tax.total));
    record.insert("payment_breakdown".to_string(), Value::Object(by_method));
    record.insert("status".to_string(), json!("issued"));

    let created = create_row(&mut *conn, "invoices", &record).await?;
    tracing::info!(booking_id = %booking.id, number = %number, kind = kind.as_str(), "Invoice issued");
    Ok(created)
}

/// The booking's current (non-void) invoice, if any.
pub async fn issued_invoice(conn: &mut PgConnection, booking_id: &str) -> Result<Option<Value>, AppError> {
    let mut filters = Map::new();
    filters.insert("booking_id".to_string(), json!(booking_id));
    filters.insert("status".to_string(), json!("issued"));
    let rows = list_rows(&mut *conn, "invoices", Some(&filters), 1, 0, "issued_at", false).await?;
    Ok(rows.into_iter().next())
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{build_invoice_lines, invoice_kind_for, split_vat};
    use crate::services::money::{sum_cents, to_cents};
    use crate::models::{
        Booking, BookingLine, BookingStatus, DiscountType, InvoiceKind, Payment, PaymentMethod,
        PriceType, Vehicle, VehicleStatus,
    };

    fn payment(amount: f64, method: PaymentMethod) -> Payment {
        Payment {
            id: "p".to_string(),
            booking_id: "b".to_string(),
            concept: None,
            amount,
            method,
            paid_at: None,
            notes: None,
        }
    }

    #[test]
    fn majority_by_amount_picks_the_document_kind() {
        assert_eq!(
            invoice_kind_for(&[payment(80.0, PaymentMethod::Cash), payment(20.0, PaymentMethod::CardTerminal)]),
            InvoiceKind::Ticket
        );
        assert_eq!(
            invoice_kind_for(&[
                payment(10.0, PaymentMethod::Cash),
                payment(10.0, PaymentMethod::Cash),
                payment(60.0, PaymentMethod::BankTransfer)
            ]),
            InvoiceKind::Invoice
        );
        assert_eq!(
            invoice_kind_for(&[payment(50.0, PaymentMethod::Cash), payment(50.0, PaymentMethod::Online)]),
            InvoiceKind::Invoice
        );
        assert_eq!(invoice_kind_for(&[]), InvoiceKind::Invoice);
    }

    #[test]
    fn extracts_vat_from_inclusive_totals() {
        let split = split_vat(121.0, 21.0);
        assert_eq!(split.base, 100.0);
        assert_eq!(split.tax_amount, 21.0);

        let odd = split_vat(99.99, 21.0);
        assert_eq!(to_cents(odd.base) + to_cents(odd.tax_amount), 9999);
    }

    fn booking(total_price: f64) -> Booking {
        Booking {
            id: "b".to_string(),
            organization_id: "o".to_string(),
            customer_id: "c".to_string(),
            pickup_at: Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).unwrap(),
            return_at: Utc.with_ymd_and_hms(2026, 7, 3, 10, 0, 0).unwrap(),
            status: BookingStatus::InProgress,
            total_price,
            discount_type: Some(DiscountType::Percentage),
            discount_value: Some(10.0),
            include_insurance: false,
            extras: vec![BookingLine {
                extra_id: None,
                name: "Helmet".to_string(),
                unit_price: 5.0,
                price_type: PriceType::PerDay,
                quantity: 1,
                total_price: 10.0,
            }],
            upgrades: Vec::new(),
            additional_drivers: Vec::new(),
            pickup_location: None,
            return_location: None,
            notes: None,
        }
    }

    fn scooter() -> Vehicle {
        Vehicle {
            id: "v".to_string(),
            organization_id: "o".to_string(),
            registration: "1234-ABC".to_string(),
            brand: Some("Honda".to_string()),
            model: Some("PCX".to_string()),
            vehicle_type: None,
            vehicle_group: None,
            status: VehicleStatus::Active,
            insurance_expiry: None,
            itv_expiry: None,
        }
    }

    #[test]
    fn lines_include_discount() {
        let lines = build_invoice_lines(&booking(90.0), &[(scooter(), 90.0)]);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].description, "Rental Honda PCX (1234-ABC)");
        assert_eq!(lines[2].total, -10.0);
    }

    #[test]
    fn overridden_total_gets_an_adjustment_line() {
        let lines = build_invoice_lines(&booking(70.0), &[(scooter(), 90.0)]);
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[3].description, "Adjustment");
        assert_eq!(lines[3].total, -20.0);
        assert_eq!(sum_cents(lines.iter().map(|line| line.total)), to_cents(70.0));
        assert_eq!(split_vat(70.0, 21.0).total, 70.0);
    }
}
