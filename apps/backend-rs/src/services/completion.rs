use std::collections::HashSet;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sqlx::PgConnection;

use crate::{
    db::{begin, commit},
    error::AppError,
    models::{from_row, Booking, BookingStatus, Contract, CustomerDocumentType, Inspection},
    repository::table_service::{lock_row, update_row},
    services::{
        audit::{write_audit_log_tx, AuditEntry},
        booking_data::{
            document_types, load_booking_vehicles, load_contract, load_customer,
            load_customer_documents, load_deposits, load_organization, load_payments,
            load_return_inspections,
        },
        contracts::ensure_contract_tx,
        customer_profile::missing_documents,
        email::{send_with_retry, EmailMessage},
        invoicing::{create_invoice_tx, issued_invoice, InvoiceDraft},
        reconciliation::{summarize_payments, PaymentSummary},
        review_request::{compose_review_request, ReviewRecipient, ReviewRequest},
    },
    state::AppState,
    tenancy::OrgContext,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateCheck {
    CustomerDocuments,
    SignedContract,
    FullPayment,
    NoReturnDamages,
    DepositRegistered,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateItem {
    pub check: GateCheck,
    pub passed: bool,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateReport {
    pub passed: bool,
    pub items: Vec<GateItem>,
}

impl GateReport {
    fn from_items(items: Vec<GateItem>) -> Self {
        Self {
            passed: items.iter().all(|item| item.passed),
            items,
        }
    }

    pub fn missing_items(&self) -> Vec<String> {
        self.items
            .iter()
            .flat_map(|item| item.missing.iter().cloned())
            .collect()
    }

    pub fn failed_checks(&self) -> Vec<GateCheck> {
        self.items
            .iter()
            .filter(|item| !item.passed)
            .map(|item| item.check)
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContractState {
    Missing,
    Unsigned,
    Signed,
}

impl ContractState {
    pub fn of(contract: Option<&Contract>) -> Self {
        match contract {
            None => Self::Missing,
            Some(contract) if contract.signed_at.is_some() => Self::Signed,
            Some(_) => Self::Unsigned,
        }
    }
}

/// Everything the gates look at, loaded once per evaluation.
#[derive(Debug, Clone)]
pub struct CompletionFacts {
    pub documents: HashSet<CustomerDocumentType>,
    pub contract: ContractState,
    pub payments: PaymentSummary,
    pub return_inspections: Vec<Inspection>,
    pub deposit_count: usize,
}

fn item(check: GateCheck, missing: Vec<String>) -> GateItem {
    GateItem {
        check,
        passed: missing.is_empty(),
        missing,
    }
}

fn base_items(facts: &CompletionFacts) -> Vec<GateItem> {
    let documents = missing_documents(&facts.documents)
        .into_iter()
        .map(ToOwned::to_owned)
        .collect();

    let contract = match facts.contract {
        ContractState::Signed => Vec::new(),
        ContractState::Unsigned => vec!["contract_unsigned".to_string()],
        ContractState::Missing => vec!["contract_missing".to_string()],
    };

    let payment = if facts.payments.is_fully_paid {
        Vec::new()
    } else {
        vec![facts.payments.pending_label()]
    };

    let damages = facts
        .return_inspections
        .iter()
        .flat_map(|inspection| inspection.unresolved_damages())
        .map(|damage| format!("damage: {}", damage.location))
        .collect();

    vec![
        item(GateCheck::CustomerDocuments, documents),
        item(GateCheck::SignedContract, contract),
        item(GateCheck::FullPayment, payment),
        item(GateCheck::NoReturnDamages, damages),
    ]
}

/// Documents, signed contract, full payment, no open return damages.
pub fn deposit_return_gate(facts: &CompletionFacts) -> GateReport {
    GateReport::from_items(base_items(facts))
}

/// The deposit-return conditions plus at least one registered deposit.
pub fn completion_gate(facts: &CompletionFacts) -> GateReport {
    let mut items = base_items(facts);
    let deposit = if facts.deposit_count > 0 {
        Vec::new()
    } else {
        vec!["deposit_missing".to_string()]
    };
    items.push(item(GateCheck::DepositRegistered, deposit));
    GateReport::from_items(items)
}

pub async fn load_completion_facts(
    conn: &mut PgConnection,
    booking: &Booking,
) -> Result<CompletionFacts, AppError> {
    let documents = load_customer_documents(conn, &booking.customer_id).await?;
    let contract = load_contract(conn, &booking.id).await?;
    let payments = load_payments(conn, &booking.id).await?;
    let return_inspections = load_return_inspections(conn, &booking.id).await?;
    let deposits = load_deposits(conn, &booking.id).await?;

    Ok(CompletionFacts {
        documents: document_types(&documents),
        contract: ContractState::of(contract.as_ref()),
        payments: summarize_payments(booking.total_price, &payments),
        return_inspections,
        deposit_count: deposits.len(),
    })
}

#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub override_gate: bool,
    pub override_reason: Option<String>,
    pub send_review_request: bool,
}

#[derive(Debug, Serialize)]
pub struct ReviewOutcome {
    #[serde(flatten)]
    pub request: ReviewRequest,
    pub email_sent: bool,
}

#[derive(Debug, Serialize)]
pub struct CompletionOutcome {
    pub booking: Value,
    pub contract: Value,
    pub invoice: Value,
    pub report: GateReport,
    pub overridden: bool,
    pub review_request: Option<ReviewOutcome>,
}

fn ensure_completable(booking: &Booking) -> Result<(), AppError> {
    match booking.status {
        BookingStatus::Confirmed | BookingStatus::InProgress => Ok(()),
        BookingStatus::Completed => Err(AppError::Conflict(
            "Booking is already completed.".to_string(),
        )),
        other => Err(AppError::Conflict(format!(
            "Booking in status '{}' cannot be completed.",
            other.as_str()
        ))),
    }
}

/// Evaluates the gate and, when it passes or is overridden, completes the
/// booking, ensures its contract and issues the invoice in one transaction.
/// The booking row stays locked for the whole transaction so two concurrent
/// completions cannot both succeed.
pub async fn complete_booking(
    state: &AppState,
    ctx: &OrgContext,
    booking_id: &str,
    request: &CompletionRequest,
) -> Result<CompletionOutcome, AppError> {
    let mut tx = begin(state).await?;

    let before = lock_row(&mut tx, "bookings", booking_id, "id").await?;
    let booking: Booking = from_row(&before, "bookings")?;
    if booking.organization_id != ctx.org_id {
        return Err(AppError::NotFound("bookings record not found.".to_string()));
    }
    ensure_completable(&booking)?;

    let facts = load_completion_facts(&mut tx, &booking).await?;
    let report = completion_gate(&facts);
    let overridden = !report.passed;
    if overridden {
        if !request.override_gate {
            tracing::info!(booking_id, missing = ?report.missing_items(), "Completion blocked");
            return Err(AppError::Blocked {
                message: "Booking cannot be completed yet.".to_string(),
                details: json!(report),
            });
        }
        if request
            .override_reason
            .as_deref()
            .map_or(true, |reason| reason.trim().is_empty())
        {
            return Err(AppError::BadRequest(
                "override_reason is required when overriding the completion checks.".to_string(),
            ));
        }
    }

    let contract = ensure_contract_tx(&mut tx, &booking, Utc::now()).await?;
    let invoice = match issued_invoice(&mut tx, &booking.id).await? {
        Some(invoice) => invoice,
        None => {
            let vehicles = load_booking_vehicles(&mut tx, &booking.id).await?;
            let payments = load_payments(&mut tx, &booking.id).await?;
            create_invoice_tx(
                &mut tx,
                InvoiceDraft {
                    booking: &booking,
                    vehicles: &vehicles,
                    payments: &payments,
                    vat_rate_percent: state.config.vat_rate_percent,
                    issued_at: Utc::now(),
                },
            )
            .await?
        }
    };

    let mut patch = Map::new();
    patch.insert("status".to_string(), json!(BookingStatus::Completed.as_str()));
    patch.insert("completed_at".to_string(), json!(Utc::now().to_rfc3339()));
    patch.insert("completed_by_user_id".to_string(), json!(ctx.user_id));
    patch.insert("completion_override".to_string(), json!(overridden));
    if overridden {
        patch.insert(
            "completion_override_reason".to_string(),
            json!(request.override_reason),
        );
    }
    let updated = update_row(&mut *tx, "bookings", booking_id, &patch, "id").await?;

    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(ctx, "complete", "bookings", booking_id)
            .before(before)
            .after(json!({
                "booking": updated,
                "override": overridden,
                "override_reason": request.override_reason,
                "failed_checks": report.failed_checks(),
            })),
    )
    .await?;
    commit(tx).await?;

    tracing::info!(booking_id, overridden, "Booking completed");

    let review_request = if request.send_review_request {
        send_review_request(state, &booking).await
    } else {
        None
    };

    Ok(CompletionOutcome {
        booking: updated,
        contract,
        invoice,
        report,
        overridden,
        review_request,
    })
}

/// Composes the review message; emails it when possible. Never fails the
/// completion: problems are logged and reflected in `email_sent`.
async fn send_review_request(state: &AppState, booking: &Booking) -> Option<ReviewOutcome> {
    let mut conn = match crate::db::acquire(state).await {
        Ok(conn) => conn,
        Err(error) => {
            tracing::warn!(booking_id = %booking.id, error = %error, "Review request skipped");
            return None;
        }
    };
    let customer = load_customer(&mut conn, &booking.customer_id).await;
    let organization = load_organization(&mut conn, &booking.organization_id).await;
    let (customer, organization) = match (customer, organization) {
        (Ok(customer), Ok(organization)) => (customer, organization),
        (Err(error), _) | (_, Err(error)) => {
            tracing::warn!(booking_id = %booking.id, error = %error, "Review request skipped");
            return None;
        }
    };

    let review_url = organization
        .review_url
        .clone()
        .or_else(|| state.config.review_url.clone())
        .unwrap_or_else(|| state.config.app_public_url.clone());
    let request = compose_review_request(
        &ReviewRecipient {
            first_name: customer.first_name(),
            phone: customer.phone_e164.as_deref(),
            email: customer.email.as_deref(),
            language: customer
                .preferred_language
                .as_deref()
                .or(organization.default_locale.as_deref()),
        },
        &organization.name,
        &review_url,
    );

    let mut email_sent = false;
    if let (Some(to), Ok(mailer)) = (request.email_to.clone(), state.mailer()) {
        let message = EmailMessage {
            to,
            subject: request.email_subject.clone(),
            html: request.email_html.clone(),
            text: Some(request.message.clone()),
            ..EmailMessage::default()
        };
        match send_with_retry(mailer, &state.config, &message).await {
            Ok(()) => email_sent = true,
            Err(error) => {
                tracing::warn!(booking_id = %booking.id, error = %error, "Review email not sent")
            }
        }
    }

    Some(ReviewOutcome { request, email_sent })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::Utc;

    use super::{completion_gate, deposit_return_gate, CompletionFacts, ContractState, GateCheck};
    use crate::models::{CustomerDocumentType as Doc, Damage, Inspection, InspectionKind, Payment, PaymentMethod};
    use crate::services::reconciliation::summarize_payments;

    fn payment(amount: f64) -> Payment {
        Payment {
            id: "p".to_string(),
            booking_id: "b".to_string(),
            concept: None,
            amount,
            method: PaymentMethod::CardTerminal,
            paid_at: None,
            notes: None,
        }
    }

    fn return_inspection(damages: Vec<Damage>) -> Inspection {
        Inspection {
            id: "i".to_string(),
            organization_id: "o".to_string(),
            booking_id: "b".to_string(),
            vehicle_id: "v".to_string(),
            kind: InspectionKind::Return,
            paired_inspection_id: Some("d".to_string()),
            odometer_km: None,
            fuel_level: None,
            notes: None,
            damages,
            inspected_at: Utc::now(),
        }
    }

    fn damage(resolved: bool) -> Damage {
        Damage {
            location: "rear fender".to_string(),
            description: None,
            severity: Some("minor".to_string()),
            resolved,
        }
    }

    fn ready() -> CompletionFacts {
        CompletionFacts {
            documents: HashSet::from([Doc::Passport, Doc::DriverLicenseFront, Doc::DriverLicenseBack]),
            contract: ContractState::Signed,
            payments: summarize_payments(100.0, &[payment(100.0)]),
            return_inspections: vec![return_inspection(Vec::new())],
            deposit_count: 1,
        }
    }

    #[test]
    fn ready_booking_passes_both_gates() {
        assert!(completion_gate(&ready()).passed);
        assert!(deposit_return_gate(&ready()).passed);
    }

    #[test]
    fn pending_balance_blocks_until_paid() {
        let mut facts = ready();
        facts.payments = summarize_payments(100.0, &[payment(60.0)]);
        let report = completion_gate(&facts);
        assert!(!report.passed);
        assert_eq!(report.failed_checks(), vec![GateCheck::FullPayment]);
        assert!(report.missing_items().iter().any(|item| item.contains("pending €40")));

        facts.payments = summarize_payments(100.0, &[payment(60.0), payment(40.0)]);
        assert!(completion_gate(&facts).passed);
    }

    #[test]
    fn one_open_damage_fails_regardless_of_the_rest() {
        let mut facts = ready();
        facts.return_inspections = vec![return_inspection(vec![damage(false)])];
        let report = completion_gate(&facts);
        assert_eq!(report.failed_checks(), vec![GateCheck::NoReturnDamages]);

        facts.return_inspections = vec![return_inspection(vec![damage(true)])];
        assert!(completion_gate(&facts).passed);
    }

    #[test]
    fn missing_deposit_only_blocks_completion() {
        let mut facts = ready();
        facts.deposit_count = 0;
        assert!(deposit_return_gate(&facts).passed);
        assert_eq!(completion_gate(&facts).failed_checks(), vec![GateCheck::DepositRegistered]);
    }

    #[test]
    fn unsigned_contract_and_documents_are_itemized() {
        let mut facts = ready();
        facts.contract = ContractState::Unsigned;
        facts.documents = HashSet::from([Doc::DriverLicenseFront, Doc::DriverLicenseBack]);
        let report = deposit_return_gate(&facts);
        assert_eq!(
            report.missing_items(),
            vec!["identity_document".to_string(), "contract_unsigned".to_string()]
        );
    }
}
