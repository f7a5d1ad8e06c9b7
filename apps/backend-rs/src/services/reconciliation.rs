use serde::Serialize;

use crate::{
    error::AppError,
    models::{Deposit, DepositStatus, Payment},
    services::money::{format_eur, from_cents, sum_cents, to_cents},
};

pub const MAX_DEPOSITS_PER_BOOKING: i64 = 3;

/// Payment position of a booking. The same numbers feed the payments list,
/// the booking summary and the completion gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentSummary {
    pub total_price: f64,
    pub total_paid: f64,
    pub pending: f64,
    pub is_fully_paid: bool,
    pub payment_count: usize,
}

pub fn summarize_payments(total_price: f64, payments: &[Payment]) -> PaymentSummary {
    let price_cents = to_cents(total_price);
    let paid_cents = sum_cents(payments.iter().map(|payment| payment.amount));
    let pending_cents = (price_cents - paid_cents).max(0);
    PaymentSummary {
        total_price: from_cents(price_cents),
        total_paid: from_cents(paid_cents),
        pending: from_cents(pending_cents),
        is_fully_paid: pending_cents == 0,
        payment_count: payments.len(),
    }
}

impl PaymentSummary {
    pub fn pending_label(&self) -> String {
        format!("pending {}", format_eur(self.pending))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DepositSummary {
    pub count: usize,
    pub held_total: f64,
    pub returned_total: f64,
    pub withheld_total: f64,
}

pub fn summarize_deposits(deposits: &[Deposit]) -> DepositSummary {
    let held = sum_cents(
        deposits
            .iter()
            .filter(|deposit| deposit.status == DepositStatus::Held)
            .map(|deposit| deposit.amount),
    );
    DepositSummary {
        count: deposits.len(),
        held_total: from_cents(held),
        returned_total: from_cents(sum_cents(
            deposits.iter().filter_map(|deposit| deposit.returned_amount),
        )),
        withheld_total: from_cents(sum_cents(
            deposits.iter().filter_map(|deposit| deposit.withheld_amount),
        )),
    }
}

/// What the operator enters when a deposit goes back to the customer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WithheldBreakdown {
    pub damages: f64,
    pub fines: f64,
    pub extension: f64,
    pub other: f64,
}

impl WithheldBreakdown {
    pub fn total_cents(&self) -> i64 {
        sum_cents([self.damages, self.fines, self.extension, self.other])
    }
}

/// Checks an operator-entered settlement against the deposit amount and
/// returns the withheld amount once every rule holds.
pub fn validate_settlement(
    deposit_amount: f64,
    status: DepositStatus,
    returned_amount: f64,
    withheld_amount: f64,
    breakdown: &WithheldBreakdown,
) -> Result<f64, AppError> {
    let mut problems = Vec::new();
    let amounts = [
        ("returned_amount", returned_amount),
        ("withheld_amount", withheld_amount),
        ("withheld_damages", breakdown.damages),
        ("withheld_fines", breakdown.fines),
        ("withheld_extension", breakdown.extension),
        ("withheld_other", breakdown.other),
    ];
    for (field, value) in amounts {
        if !value.is_finite() || value < 0.0 {
            problems.push(format!("{field} must be zero or positive."));
        }
    }

    let amount = to_cents(deposit_amount);
    let returned = to_cents(returned_amount);
    let withheld = to_cents(withheld_amount);
    if returned + withheld != amount {
        problems.push(format!(
            "returned ({}) + withheld ({}) must equal the deposit ({}).",
            format_eur(returned_amount),
            format_eur(withheld_amount),
            format_eur(deposit_amount)
        ));
    }
    if breakdown.total_cents() != withheld {
        problems.push(format!(
            "withheld breakdown ({}) must add up to the withheld amount ({}).",
            format_eur(from_cents(breakdown.total_cents())),
            format_eur(withheld_amount)
        ));
    }
    match status {
        DepositStatus::Returned if withheld != 0 => {
            problems.push("A fully returned deposit cannot withhold any amount.".to_string())
        }
        DepositStatus::PartiallyReturned if withheld <= 0 => problems
            .push("A partially returned deposit must withhold a positive amount.".to_string()),
        DepositStatus::Held => {
            problems.push("Settlement requires status returned or partially_returned.".to_string())
        }
        _ => {}
    }

    if problems.is_empty() {
        Ok(from_cents(withheld))
    } else {
        Err(AppError::UnprocessableEntity(problems.join(" ")))
    }
}

#[cfg(test)]
mod tests {
    use super::{summarize_deposits, summarize_payments, validate_settlement, WithheldBreakdown};
    use crate::models::{Deposit, DepositStatus, Payment, PaymentMethod};

    fn payment(amount: f64) -> Payment {
        Payment {
            id: "p".to_string(),
            booking_id: "b".to_string(),
            concept: None,
            amount,
            method: PaymentMethod::Cash,
            paid_at: None,
            notes: None,
        }
    }

    #[test]
    fn pending_amount_follows_payments() {
        let summary = summarize_payments(100.0, &[payment(60.0)]);
        assert!(!summary.is_fully_paid);
        assert_eq!(summary.pending, 40.0);
        assert_eq!(summary.pending_label(), "pending €40.00");

        let summary = summarize_payments(100.0, &[payment(60.0), payment(40.0)]);
        assert!(summary.is_fully_paid);
        assert_eq!(summary.pending, 0.0);
    }

    #[test]
    fn cent_fractions_do_not_drift() {
        let payments = [payment(33.33), payment(33.33), payment(33.34)];
        let summary = summarize_payments(100.0, &payments);
        assert_eq!(summary.total_paid, 100.0);
        assert!(summary.is_fully_paid);
    }

    #[test]
    fn overpayment_is_never_negative_pending() {
        let summary = summarize_payments(50.0, &[payment(70.0)]);
        assert_eq!(summary.pending, 0.0);
        assert_eq!(summary.total_paid, 70.0);
    }

    #[test]
    fn partial_return_must_balance() {
        let breakdown = WithheldBreakdown {
            damages: 50.0,
            fines: 20.0,
            ..WithheldBreakdown::default()
        };
        let withheld = validate_settlement(
            300.0,
            DepositStatus::PartiallyReturned,
            230.0,
            70.0,
            &breakdown,
        )
        .expect("balanced");
        assert_eq!(withheld, 70.0);

        assert!(validate_settlement(300.0, DepositStatus::PartiallyReturned, 250.0, 70.0, &breakdown).is_err());
        assert!(validate_settlement(
            300.0,
            DepositStatus::PartiallyReturned,
            230.0,
            70.0,
            &WithheldBreakdown::default()
        )
        .is_err());
    }

    #[test]
    fn full_return_withholds_nothing() {
        let none = WithheldBreakdown::default();
        assert!(validate_settlement(300.0, DepositStatus::Returned, 300.0, 0.0, &none).is_ok());
        assert!(validate_settlement(300.0, DepositStatus::PartiallyReturned, 300.0, 0.0, &none).is_err());
        assert!(validate_settlement(300.0, DepositStatus::Returned, -1.0, 301.0, &none).is_err());
    }

    #[test]
    fn deposit_totals() {
        let deposit = |amount: f64, status, returned: Option<f64>, withheld: Option<f64>| Deposit {
            id: "d".to_string(),
            booking_id: "b".to_string(),
            amount,
            payment_method: PaymentMethod::Cash,
            status,
            returned_amount: returned,
            withheld_amount: withheld,
            withheld_damages: None,
            withheld_fines: None,
            withheld_extension: None,
            withheld_other: None,
            return_method: None,
            returned_at: None,
        };
        let summary = summarize_deposits(&[
            deposit(200.0, DepositStatus::Held, None, None),
            deposit(300.0, DepositStatus::PartiallyReturned, Some(230.0), Some(70.0)),
        ]);
        assert_eq!(summary.count, 2);
        assert_eq!(summary.held_total, 200.0);
        assert_eq!(summary.returned_total, 230.0);
        assert_eq!(summary.withheld_total, 70.0);
    }
}
