use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    error::AppError,
    models::{BookingLine, Discount, DiscountType, PriceType, PricingGroup},
    services::money::{from_cents, round_money, sum_cents, to_cents},
};

const MINUTES_PER_DAY: i64 = 24 * 60;

/// Billable days for a window: started 24 h blocks, at least one. Minutes past
/// a whole day up to `grace_minutes` are not charged as a new day.
pub fn rental_days(
    pickup_at: DateTime<Utc>,
    return_at: DateTime<Utc>,
    grace_minutes: i64,
) -> Result<i64, AppError> {
    if return_at <= pickup_at {
        return Err(AppError::BadRequest(
            "return_at must be after pickup_at.".to_string(),
        ));
    }
    let minutes = (return_at - pickup_at).num_minutes();
    let full_days = minutes / MINUTES_PER_DAY;
    let remainder = minutes % MINUTES_PER_DAY;
    let days = if full_days == 0 || remainder > grace_minutes.max(0) {
        full_days + 1
    } else {
        full_days
    };
    Ok(days.max(1))
}

/// Tier lookup for a group. `None` when the group has no tiers.
pub fn group_price(group: &PricingGroup, days: i64) -> Option<f64> {
    let mut tiers = group
        .tiers
        .iter()
        .filter(|tier| tier.days > 0 && tier.price >= 0.0)
        .collect::<Vec<_>>();
    tiers.sort_by_key(|tier| tier.days);
    let smallest = *tiers.first()?;

    if let Some(exact) = tiers.iter().find(|tier| tier.days == days) {
        return Some(round_money(exact.price));
    }

    match tiers.iter().rev().find(|tier| tier.days < days) {
        Some(below) => {
            let extra_days = (days - below.days) as f64;
            let per_extra_day = if group.extra_day_price > 0.0 {
                group.extra_day_price
            } else {
                below.price / below.days as f64
            };
            Some(round_money(below.price + per_extra_day * extra_days))
        }
        None => Some(round_money(
            smallest.price / smallest.days as f64 * days as f64,
        )),
    }
}

pub fn vehicle_price(group: &PricingGroup, days: i64, include_insurance: bool) -> Option<f64> {
    let base = group_price(group, days)?;
    let insurance = if include_insurance {
        group.insurance_per_day.max(0.0) * days as f64
    } else {
        0.0
    };
    Some(round_money(base + insurance))
}

pub fn line_total(unit_price: f64, price_type: PriceType, quantity: u32, days: i64) -> f64 {
    let quantity = f64::from(quantity.max(1));
    let total = match price_type {
        PriceType::Flat => unit_price * quantity,
        PriceType::PerDay => unit_price * days.max(1) as f64 * quantity,
    };
    round_money(total)
}

/// Recomputes every line for a new duration; flat lines keep their total.
pub fn reprice_lines(lines: &[BookingLine], days: i64) -> Vec<BookingLine> {
    lines
        .iter()
        .map(|line| BookingLine {
            total_price: line_total(line.unit_price, line.price_type, line.quantity, days),
            ..line.clone()
        })
        .collect()
}

/// Returns `(discount_amount, total)`; the total never goes below zero.
pub fn apply_discount(subtotal: f64, discount: Option<Discount>) -> (f64, f64) {
    let subtotal_cents = to_cents(subtotal);
    let Some(discount) = discount else {
        return (0.0, from_cents(subtotal_cents));
    };
    let value = discount.value.max(0.0);
    let total_cents = match discount.kind {
        DiscountType::Flat => subtotal_cents - to_cents(value),
        DiscountType::Percentage => {
            subtotal_cents - (subtotal_cents as f64 * value / 100.0).round() as i64
        }
    }
    .max(0);
    (
        from_cents(subtotal_cents - total_cents),
        from_cents(total_cents),
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceBreakdown {
    pub rental_days: i64,
    pub vehicles_total: f64,
    pub extras_total: f64,
    pub upgrades_total: f64,
    pub subtotal: f64,
    pub discount_amount: f64,
    pub final_total: f64,
}

pub fn compose_total(
    rental_days: i64,
    vehicle_prices: &[f64],
    extras: &[BookingLine],
    upgrades: &[BookingLine],
    discount: Option<Discount>,
) -> PriceBreakdown {
    let vehicles = sum_cents(vehicle_prices.iter().copied());
    let extras_cents = sum_cents(extras.iter().map(|line| line.total_price));
    let upgrades_cents = sum_cents(upgrades.iter().map(|line| line.total_price));
    let subtotal = from_cents(vehicles + extras_cents + upgrades_cents);
    let (discount_amount, final_total) = apply_discount(subtotal, discount);

    PriceBreakdown {
        rental_days,
        vehicles_total: from_cents(vehicles),
        extras_total: from_cents(extras_cents),
        upgrades_total: from_cents(upgrades_cents),
        subtotal,
        discount_amount,
        final_total,
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{
        apply_discount, compose_total, group_price, line_total, rental_days, reprice_lines,
        vehicle_price,
    };
    use crate::models::{BookingLine, Discount, DiscountType, PriceTier, PriceType, PricingGroup};

    fn group() -> PricingGroup {
        PricingGroup {
            id: "g".to_string(),
            organization_id: "o".to_string(),
            vehicle_group: "scooter-125".to_string(),
            tiers: vec![
                PriceTier { days: 7, price: 175.0 },
                PriceTier { days: 1, price: 35.0 },
                PriceTier { days: 3, price: 90.0 },
            ],
            extra_day_price: 25.0,
            insurance_per_day: 5.0,
        }
    }

    fn line(unit: f64, price_type: PriceType, quantity: u32) -> BookingLine {
        BookingLine {
            extra_id: None,
            name: "Helmet".to_string(),
            unit_price: unit,
            price_type,
            quantity,
            total_price: 0.0,
        }
    }

    #[test]
    fn counts_started_days_with_grace() {
        let pickup = Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).unwrap();
        assert_eq!(rental_days(pickup, pickup + Duration::hours(3), 59).unwrap(), 1);
        assert_eq!(rental_days(pickup, pickup + Duration::hours(24), 59).unwrap(), 1);
        assert_eq!(
            rental_days(pickup, pickup + Duration::minutes(24 * 60 + 45), 59).unwrap(),
            1
        );
        assert_eq!(
            rental_days(pickup, pickup + Duration::minutes(24 * 60 + 60), 59).unwrap(),
            2
        );
        assert!(rental_days(pickup, pickup, 59).is_err());
    }

    #[test]
    fn tier_lookup() {
        let group = group();
        assert_eq!(group_price(&group, 3), Some(90.0));
        assert_eq!(group_price(&group, 5), Some(140.0));
        assert_eq!(group_price(&group, 10), Some(250.0));
        assert_eq!(vehicle_price(&group, 3, true), Some(105.0));
    }

    #[test]
    fn prorates_below_smallest_tier_and_handles_empty_groups() {
        let mut group = group();
        group.tiers = vec![PriceTier { days: 3, price: 90.0 }];
        assert_eq!(group_price(&group, 1), Some(30.0));
        group.tiers.clear();
        assert_eq!(group_price(&group, 1), None);
    }

    #[test]
    fn percentage_and_flat_discounts_clamp_at_zero() {
        let pct = Discount { kind: DiscountType::Percentage, value: 10.0 };
        assert_eq!(apply_discount(200.0, Some(pct)), (20.0, 180.0));
        let over = Discount { kind: DiscountType::Percentage, value: 150.0 };
        assert_eq!(apply_discount(80.0, Some(over)).1, 0.0);
        let flat = Discount { kind: DiscountType::Flat, value: 30.0 };
        assert_eq!(apply_discount(25.0, Some(flat)), (25.0, 0.0));
        assert_eq!(apply_discount(25.0, None), (0.0, 25.0));
    }

    #[test]
    fn upgrades_follow_duration_changes() {
        let upgrades = vec![line(12.0, PriceType::PerDay, 1), line(4.5, PriceType::PerDay, 2)];
        let one_day = reprice_lines(&upgrades, 1);
        assert_eq!(one_day[0].total_price, 12.0);
        let three_days = reprice_lines(&one_day, 3);
        assert_eq!(three_days[0].total_price, 36.0);
        assert_eq!(three_days[1].total_price, 27.0);
        assert_eq!(line_total(10.0, PriceType::Flat, 2, 3), 20.0);
    }

    #[test]
    fn composes_vehicle_extra_and_upgrade_totals() {
        let extras = reprice_lines(&[line(3.0, PriceType::PerDay, 1)], 3);
        let upgrades = reprice_lines(&[line(15.0, PriceType::Flat, 1)], 3);
        let discount = Discount { kind: DiscountType::Flat, value: 10.0 };
        let breakdown = compose_total(3, &[90.0, 90.0], &extras, &upgrades, Some(discount));
        assert_eq!(breakdown.subtotal, 204.0);
        assert_eq!(breakdown.discount_amount, 10.0);
        assert_eq!(breakdown.final_total, 194.0);
    }
}
