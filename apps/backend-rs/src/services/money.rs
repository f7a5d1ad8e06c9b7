//! Money is carried as `f64` euros in JSON and summed in integer cents.

pub fn to_cents(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

pub fn from_cents(cents: i64) -> f64 {
    cents as f64 / 100.0
}

pub fn round_money(amount: f64) -> f64 {
    from_cents(to_cents(amount))
}

pub fn sum_cents<I>(amounts: I) -> i64
where
    I: IntoIterator<Item = f64>,
{
    amounts.into_iter().map(to_cents).sum()
}

/// `€1,234.50`-style label used in reports and documents.
pub fn format_eur(amount: f64) -> String {
    let cents = to_cents(amount);
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.abs();
    let whole = (cents / 100).to_string();
    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (index, digit) in whole.chars().enumerate() {
        if index > 0 && (whole.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(digit);
    }
    format!("{sign}€{grouped}.{:02}", cents % 100)
}

#[cfg(test)]
mod tests {
    use super::{format_eur, round_money, sum_cents, to_cents};

    #[test]
    fn sums_without_float_drift() {
        let total = sum_cents([0.1, 0.2, 0.3, 33.33, 33.33, 33.34]);
        assert_eq!(total, 10_060);
        assert_eq!(to_cents(19.999), 2000);
        assert_eq!(round_money(0.1 + 0.2), 0.3);
    }

    #[test]
    fn formats_euros() {
        assert_eq!(format_eur(40.0), "€40.00");
        assert_eq!(format_eur(1234.5), "€1,234.50");
        assert_eq!(format_eur(-12.3), "-€12.30");
    }
}
