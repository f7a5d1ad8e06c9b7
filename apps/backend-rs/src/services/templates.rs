//! HTML documents rendered to PDF. Every interpolated value goes through
//! [`escape_html`]; data URIs are only emitted for base64 image payloads.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::{
    models::{Damage, InspectionKind},
    services::money::format_eur,
};

pub fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for character in raw.chars() {
        match character {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

pub fn parse_timezone(name: Option<&str>, fallback: &str) -> Tz {
    name.and_then(|value| value.trim().parse::<Tz>().ok())
        .or_else(|| fallback.parse::<Tz>().ok())
        .unwrap_or(chrono_tz::Europe::Madrid)
}

pub fn format_local(at: DateTime<Utc>, timezone: Tz) -> String {
    at.with_timezone(&timezone).format("%d/%m/%Y %H:%M").to_string()
}

fn image_tag(data_uri: &str, alt: &str) -> String {
    if !data_uri.starts_with("data:image/") || !data_uri.contains(";base64,") {
        return String::new();
    }
    format!(
        "<img src=\"{}\" alt=\"{}\"/>",
        data_uri.replace('"', ""),
        escape_html(alt)
    )
}

const STYLE: &str = "body{font-family:Helvetica,Arial,sans-serif;font-size:12px;color:#222}\
h1{font-size:18px;margin:0 0 8px}h2{font-size:14px;margin:16px 0 6px}\
table{width:100%;border-collapse:collapse}td,th{border:1px solid #ccc;padding:4px;text-align:left}\
.photos img{width:48%;margin:1%}.cols{display:flex}.cols>div{width:50%;padding:0 6px}\
.signature img{max-height:80px}.muted{color:#777}";

fn document(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"/><title>{}</title><style>{STYLE}</style></head><body>{body}</body></html>",
        escape_html(title)
    )
}

#[derive(Debug, Clone)]
pub struct PhotoView {
    pub label: Option<String>,
    pub data_uri: String,
}

#[derive(Debug, Clone)]
pub struct InspectionView {
    pub organization_name: String,
    pub kind: InspectionKind,
    pub vehicle_label: String,
    pub customer_name: String,
    pub booking_reference: String,
    pub inspected_at: String,
    pub odometer_km: Option<i64>,
    pub fuel_level: Option<i32>,
    pub notes: Option<String>,
    pub damages: Vec<Damage>,
    pub photos: Vec<PhotoView>,
}

fn kind_label(kind: InspectionKind) -> &'static str {
    match kind {
        InspectionKind::Delivery => "Delivery inspection",
        InspectionKind::Return => "Return inspection",
    }
}

fn damages_table(damages: &[Damage]) -> String {
    if damages.is_empty() {
        return "<p class=\"muted\">No damages recorded.</p>".to_string();
    }
    let rows = damages
        .iter()
        .map(|damage| {
            format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                escape_html(&damage.location),
                escape_html(damage.description.as_deref().unwrap_or("")),
                escape_html(damage.severity.as_deref().unwrap_or("")),
                if damage.resolved { "resolved" } else { "open" }
            )
        })
        .collect::<String>();
    format!(
        "<table><tr><th>Location</th><th>Description</th><th>Severity</th><th>State</th></tr>{rows}</table>"
    )
}

fn inspection_section(view: &InspectionView) -> String {
    let photos = view
        .photos
        .iter()
        .map(|photo| image_tag(&photo.data_uri, photo.label.as_deref().unwrap_or("photo")))
        .collect::<String>();
    format!(
        "<h2>{kind}</h2>\
         <table>\
         <tr><th>Date</th><td>{date}</td></tr>\
         <tr><th>Odometer</th><td>{odometer}</td></tr>\
         <tr><th>Fuel / battery</th><td>{fuel}</td></tr>\
         <tr><th>Notes</th><td>{notes}</td></tr>\
         </table>\
         <h2>Damages</h2>{damages}\
         <div class=\"photos\">{photos}</div>",
        kind = kind_label(view.kind),
        date = escape_html(&view.inspected_at),
        odometer = view
            .odometer_km
            .map(|km| format!("{km} km"))
            .unwrap_or_else(|| "-".to_string()),
        fuel = view
            .fuel_level
            .map(|level| format!("{level}%"))
            .unwrap_or_else(|| "-".to_string()),
        notes = escape_html(view.notes.as_deref().unwrap_or("")),
        damages = damages_table(&view.damages),
    )
}

fn inspection_header(view: &InspectionView, title: &str) -> String {
    format!(
        "<h1>{} · {}</h1><p>{} · Customer: {} · Booking {}</p>",
        escape_html(&view.organization_name),
        escape_html(title),
        escape_html(&view.vehicle_label),
        escape_html(&view.customer_name),
        escape_html(&view.booking_reference),
    )
}

pub fn render_inspection_html(view: &InspectionView) -> String {
    let title = kind_label(view.kind);
    document(
        title,
        &format!("{}{}", inspection_header(view, title), inspection_section(view)),
    )
}

/// Delivery and return side by side.
pub fn render_comparison_html(delivery: &InspectionView, returned: &InspectionView) -> String {
    let title = "Delivery / return comparison";
    document(
        title,
        &format!(
            "{}<div class=\"cols\"><div>{}</div><div>{}</div></div>",
            inspection_header(returned, title),
            inspection_section(delivery),
            inspection_section(returned)
        ),
    )
}

#[derive(Debug, Clone)]
pub struct ContractLine {
    pub description: String,
    pub amount: f64,
}

#[derive(Debug, Clone)]
pub struct ContractView {
    pub contract_number: String,
    pub organization_name: String,
    pub organization_legal_name: Option<String>,
    pub organization_tax_id: Option<String>,
    pub organization_address: Option<String>,
    pub customer_name: String,
    pub customer_identity: Option<String>,
    pub customer_license: Option<String>,
    pub customer_address: Option<String>,
    pub additional_drivers: Vec<String>,
    pub pickup_at: String,
    pub return_at: String,
    pub pickup_location: Option<String>,
    pub return_location: Option<String>,
    pub lines: Vec<ContractLine>,
    pub discount_amount: f64,
    pub total_price: f64,
    pub deposit_amount: Option<f64>,
    pub signer_name: Option<String>,
    pub signed_at: Option<String>,
    pub signature_data_uri: Option<String>,
}

fn optional_row(label: &str, value: Option<&str>) -> String {
    match value.map(str::trim).filter(|text| !text.is_empty()) {
        Some(text) => format!("<tr><th>{}</th><td>{}</td></tr>", escape_html(label), escape_html(text)),
        None => String::new(),
    }
}

pub fn render_contract_html(view: &ContractView) -> String {
    let lines = view
        .lines
        .iter()
        .map(|line| {
            format!(
                "<tr><td>{}</td><td>{}</td></tr>",
                escape_html(&line.description),
                format_eur(line.amount)
            )
        })
        .collect::<String>();
    let discount = if view.discount_amount > 0.0 {
        format!(
            "<tr><td>Discount</td><td>-{}</td></tr>",
            format_eur(view.discount_amount)
        )
    } else {
        String::new()
    };
    let drivers = if view.additional_drivers.is_empty() {
        String::new()
    } else {
        format!(
            "<h2>Additional drivers</h2><ul>{}</ul>",
            view.additional_drivers
                .iter()
                .map(|driver| format!("<li>{}</li>", escape_html(driver)))
                .collect::<String>()
        )
    };
    let signature = match (&view.signed_at, &view.signature_data_uri) {
        (Some(signed_at), image) => format!(
            "<div class=\"signature\"><p>Signed by {} on {}</p>{}</div>",
            escape_html(view.signer_name.as_deref().unwrap_or(&view.customer_name)),
            escape_html(signed_at),
            image
                .as_deref()
                .map(|uri| image_tag(uri, "signature"))
                .unwrap_or_default()
        ),
        (None, _) => "<p class=\"muted\">Pending signature.</p>".to_string(),
    };

    let body = format!(
        "<h1>Rental agreement {number}</h1>\
         <h2>Lessor</h2><table>{org_name}{org_legal}{org_tax}{org_address}</table>\
         <h2>Customer</h2><table>{customer}{identity}{license}{customer_address}</table>\
         {drivers}\
         <h2>Rental period</h2><table>\
         <tr><th>Pickup</th><td>{pickup}</td></tr><tr><th>Return</th><td>{ret}</td></tr>\
         {pickup_location}{return_location}</table>\
         <h2>Charges</h2><table>{lines}{discount}\
         <tr><th>Total</th><th>{total}</th></tr>{deposit}</table>\
         <h2>Signature</h2>{signature}",
        number = escape_html(&view.contract_number),
        org_name = optional_row("Company", Some(&view.organization_name)),
        org_legal = optional_row("Legal name", view.organization_legal_name.as_deref()),
        org_tax = optional_row("Tax id", view.organization_tax_id.as_deref()),
        org_address = optional_row("Address", view.organization_address.as_deref()),
        customer = optional_row("Name", Some(&view.customer_name)),
        identity = optional_row("Identity", view.customer_identity.as_deref()),
        license = optional_row("Driver license", view.customer_license.as_deref()),
        customer_address = optional_row("Address", view.customer_address.as_deref()),
        pickup = escape_html(&view.pickup_at),
        ret = escape_html(&view.return_at),
        pickup_location = optional_row("Pickup location", view.pickup_location.as_deref()),
        return_location = optional_row("Return location", view.return_location.as_deref()),
        total = format_eur(view.total_price),
        deposit = view
            .deposit_amount
            .map(|amount| format!("<tr><td>Deposit</td><td>{}</td></tr>", format_eur(amount)))
            .unwrap_or_default(),
    );
    document(&format!("Contract {}", view.contract_number), &body)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{
        escape_html, format_local, parse_timezone, render_comparison_html, render_contract_html,
        render_inspection_html, ContractLine, ContractView, InspectionView, PhotoView,
    };
    use crate::models::{Damage, InspectionKind};

    fn inspection(kind: InspectionKind, damages: Vec<Damage>) -> InspectionView {
        InspectionView {
            organization_name: "Motos <Sol>".to_string(),
            kind,
            vehicle_label: "Honda PCX (1234-ABC)".to_string(),
            customer_name: "Ana".to_string(),
            booking_reference: "b-1".to_string(),
            inspected_at: "01/07/2026 10:00".to_string(),
            odometer_km: Some(1200),
            fuel_level: Some(80),
            notes: Some("<script>alert(1)</script>".to_string()),
            damages,
            photos: vec![
                PhotoView {
                    label: Some("front".to_string()),
                    data_uri: "data:image/png;base64,AQID".to_string(),
                },
                PhotoView {
                    label: None,
                    data_uri: "javascript:alert(1)".to_string(),
                },
            ],
        }
    }

    #[test]
    fn escapes_markup() {
        assert_eq!(escape_html("<a href='x'>&</a>"), "&lt;a href=&#39;x&#39;&gt;&amp;&lt;/a&gt;");
    }

    #[test]
    fn single_inspection_escapes_text_and_drops_non_image_uris() {
        let html = render_inspection_html(&inspection(InspectionKind::Delivery, Vec::new()));
        assert!(html.contains("Motos &lt;Sol&gt;"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("data:image/png;base64,AQID"));
        assert!(!html.contains("javascript:"));
        assert!(html.contains("No damages recorded."));
    }

    #[test]
    fn comparison_shows_both_sides() {
        let damage = Damage {
            location: "left mirror".to_string(),
            description: Some("scratch".to_string()),
            severity: None,
            resolved: false,
        };
        let html = render_comparison_html(
            &inspection(InspectionKind::Delivery, Vec::new()),
            &inspection(InspectionKind::Return, vec![damage]),
        );
        assert!(html.contains("Delivery inspection"));
        assert!(html.contains("Return inspection"));
        assert!(html.contains("left mirror"));
    }

    #[test]
    fn contract_shows_pending_signature_and_totals() {
        let view = ContractView {
            contract_number: "C-2026-00001".to_string(),
            organization_name: "Motos Sol".to_string(),
            organization_legal_name: None,
            organization_tax_id: Some("B12345678".to_string()),
            organization_address: None,
            customer_name: "Ana".to_string(),
            customer_identity: Some("12345678Z".to_string()),
            customer_license: None,
            customer_address: None,
            additional_drivers: vec!["Luis".to_string()],
            pickup_at: "01/07/2026 10:00".to_string(),
            return_at: "03/07/2026 10:00".to_string(),
            pickup_location: None,
            return_location: None,
            lines: vec![ContractLine {
                description: "Rental Honda PCX".to_string(),
                amount: 90.0,
            }],
            discount_amount: 0.0,
            total_price: 90.0,
            deposit_amount: Some(300.0),
            signer_name: None,
            signed_at: None,
            signature_data_uri: None,
        };
        let html = render_contract_html(&view);
        assert!(html.contains("Rental agreement C-2026-00001"));
        assert!(html.contains("Pending signature."));
        assert!(html.contains("€300.00"));
        assert!(html.contains("<li>Luis</li>"));
    }

    #[test]
    fn formats_in_organization_timezone() {
        let at = Utc.with_ymd_and_hms(2026, 7, 1, 8, 0, 0).unwrap();
        assert_eq!(format_local(at, parse_timezone(Some("Europe/Madrid"), "UTC")), "01/07/2026 10:00");
        assert_eq!(format_local(at, parse_timezone(Some("Not/AZone"), "UTC")), "01/07/2026 08:00");
    }
}
