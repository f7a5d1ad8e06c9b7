use chrono_tz::Tz;
use serde::Serialize;
use serde_json::{json, Map};
use sqlx::PgConnection;

use crate::{
    error::AppError,
    models::{from_row, from_rows, Customer, Inspection, InspectionKind, InspectionPhoto, Organization, Vehicle},
    repository::table_service::{get_row, list_rows},
    services::{
        booking_data::{load_booking, load_customer, load_organization},
        email::{send_with_retry, EmailAttachment, EmailMessage},
        pdf::PdfRenderer,
        storage::fetch_as_data_uri,
        templates::{
            escape_html, format_local, parse_timezone, render_comparison_html,
            render_inspection_html, InspectionView, PhotoView,
        },
    },
    state::AppState,
};

pub async fn load_inspection(conn: &mut PgConnection, inspection_id: &str) -> Result<Inspection, AppError> {
    let row = get_row(&mut *conn, "inspections", inspection_id, "id").await?;
    from_row(&row, "inspections")
}

pub async fn load_photos(conn: &mut PgConnection, inspection_id: &str) -> Result<Vec<InspectionPhoto>, AppError> {
    let mut filters = Map::new();
    filters.insert("inspection_id".to_string(), json!(inspection_id));
    let rows = list_rows(&mut *conn, "inspection_photos", Some(&filters), 100, 0, "created_at", true).await?;
    from_rows(&rows, "inspection_photos")
}

/// Photos that cannot be fetched are left out of the document.
async fn embed_photos(state: &AppState, inspection_id: &str, photos: &[InspectionPhoto]) -> Vec<PhotoView> {
    let mut views = Vec::with_capacity(photos.len());
    for photo in photos {
        match fetch_as_data_uri(
            state.storage.as_ref(),
            &state.http_client,
            &photo.storage_key,
            photo.mime_type.as_deref(),
        )
        .await
        {
            Ok(data_uri) => views.push(PhotoView {
                label: photo.label.clone(),
                data_uri,
            }),
            Err(error) => tracing::warn!(
                inspection_id,
                photo_id = %photo.id,
                error = %error,
                "Skipping inspection photo"
            ),
        }
    }
    views
}

struct ReportContext {
    organization: Organization,
    customer: Customer,
    vehicle: Vehicle,
    timezone: Tz,
}

async fn inspection_view(
    state: &AppState,
    conn: &mut PgConnection,
    context: &ReportContext,
    inspection: &Inspection,
) -> Result<InspectionView, AppError> {
    let photos = load_photos(conn, &inspection.id).await?;
    Ok(InspectionView {
        organization_name: context.organization.name.clone(),
        kind: inspection.kind,
        vehicle_label: context.vehicle.display_name(),
        customer_name: context.customer.full_name.clone(),
        booking_reference: inspection.booking_id.clone(),
        inspected_at: format_local(inspection.inspected_at, context.timezone),
        odometer_km: inspection.odometer_km,
        fuel_level: inspection.fuel_level,
        notes: inspection.notes.clone(),
        damages: inspection.damages.clone(),
        photos: embed_photos(state, &inspection.id, &photos).await,
    })
}

#[derive(Debug, Serialize)]
pub struct InspectionPdf {
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub file_name: String,
    pub comparison: bool,
    #[serde(skip)]
    pub customer: Customer,
    #[serde(skip)]
    pub organization: Organization,
}

/// Side-by-side PDF for a paired return inspection; any failure on that path
/// falls back to the single-inspection PDF.
pub async fn render_inspection_pdf(
    state: &AppState,
    conn: &mut PgConnection,
    inspection_id: &str,
) -> Result<InspectionPdf, AppError> {
    let inspection = load_inspection(conn, inspection_id).await?;
    let (_, booking) = load_booking(conn, &inspection.booking_id).await?;
    let organization = load_organization(conn, &inspection.organization_id).await?;
    let customer = load_customer(conn, &booking.customer_id).await?;
    let vehicle: Vehicle = from_row(
        &get_row(&mut *conn, "vehicles", &inspection.vehicle_id, "id").await?,
        "vehicles",
    )?;
    let timezone = parse_timezone(organization.timezone.as_deref(), &state.config.default_timezone);
    let context = ReportContext {
        organization,
        customer,
        vehicle,
        timezone,
    };

    let current = inspection_view(state, conn, &context, &inspection).await?;
    let delivery = match (inspection.kind, inspection.paired_inspection_id.as_deref()) {
        (InspectionKind::Return, Some(paired_id)) => {
            match paired_view(state, conn, &context, paired_id).await {
                Ok(view) => Some(view),
                Err(error) => {
                    tracing::warn!(
                        inspection_id,
                        paired_inspection_id = paired_id,
                        error = %error,
                        "Paired delivery inspection unavailable"
                    );
                    None
                }
            }
        }
        _ => None,
    };

    let (bytes, comparison) =
        render_document(state.pdf_renderer.as_ref(), &current, delivery.as_ref()).await?;
    let file_name = if comparison {
        format!("inspection-comparison-{}.pdf", inspection.id)
    } else {
        format!("inspection-{}-{}.pdf", inspection.kind.as_str(), inspection.id)
    };
    Ok(InspectionPdf {
        bytes,
        file_name,
        comparison,
        customer: context.customer,
        organization: context.organization,
    })
}

async fn paired_view(
    state: &AppState,
    conn: &mut PgConnection,
    context: &ReportContext,
    delivery_id: &str,
) -> Result<InspectionView, AppError> {
    let delivery = load_inspection(conn, delivery_id).await?;
    inspection_view(state, conn, context, &delivery).await
}

/// Returns the PDF bytes and whether they hold the comparison layout.
async fn render_document(
    renderer: &dyn PdfRenderer,
    current: &InspectionView,
    delivery: Option<&InspectionView>,
) -> Result<(Vec<u8>, bool), AppError> {
    if let Some(delivery) = delivery {
        match renderer.render(&render_comparison_html(delivery, current)).await {
            Ok(bytes) => return Ok((bytes, true)),
            Err(error) => tracing::warn!(
                error = %error,
                "Comparison PDF failed, falling back to single inspection"
            ),
        }
    }
    let bytes = renderer.render(&render_inspection_html(current)).await?;
    Ok((bytes, false))
}

pub(crate) fn resolve_recipient(override_to: Option<&str>, customer: &Customer) -> Result<String, AppError> {
    override_to
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .or_else(|| {
            customer
                .email
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned)
        })
        .ok_or_else(|| {
            AppError::BadRequest("Customer has no email address; pass a recipient.".to_string())
        })
}

#[derive(Debug, Serialize)]
pub struct SendOutcome {
    pub recipient: String,
    pub file_name: String,
    pub comparison: bool,
}

pub async fn send_inspection_report(
    state: &AppState,
    conn: &mut PgConnection,
    inspection_id: &str,
    recipient_override: Option<&str>,
) -> Result<SendOutcome, AppError> {
    let mailer = state.mailer()?;
    let pdf = render_inspection_pdf(state, conn, inspection_id).await?;
    let recipient = resolve_recipient(recipient_override, &pdf.customer)?;

    let subject = format!("{} · vehicle inspection", pdf.organization.name);
    let message = EmailMessage {
        to: recipient.clone(),
        subject,
        html: format!(
            "<p>Hello {},</p><p>Please find attached the vehicle inspection report.</p><p>{}</p>",
            escape_html(pdf.customer.first_name()),
            escape_html(&pdf.organization.name)
        ),
        text: None,
        attachments: vec![EmailAttachment {
            file_name: pdf.file_name.clone(),
            content_type: "application/pdf".to_string(),
            bytes: pdf.bytes,
        }],
        admin_copy: true,
    };
    send_with_retry(mailer, &state.config, &message).await?;
    tracing::info!(inspection_id, comparison = pdf.comparison, "Inspection report sent");

    Ok(SendOutcome {
        recipient,
        file_name: pdf.file_name,
        comparison: pdf.comparison,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;

    use super::{embed_photos, render_document, resolve_recipient};
    use crate::{
        models::{Customer, Damage, InspectionKind, InspectionPhoto},
        services::{
            pdf::fake::FakePdfRenderer,
            storage::ObjectStorage,
            templates::{InspectionView, PhotoView},
        },
        state::AppState,
    };

    fn view(kind: InspectionKind) -> InspectionView {
        InspectionView {
            organization_name: "Moto Sol".to_string(),
            kind,
            vehicle_label: "Honda PCX (1234-ABC)".to_string(),
            customer_name: "Ana Ruiz".to_string(),
            booking_reference: "bk-1".to_string(),
            inspected_at: "01/07/2026 10:00".to_string(),
            odometer_km: Some(12_000),
            fuel_level: Some(80),
            notes: None,
            damages: vec![Damage {
                location: "left mirror".to_string(),
                description: None,
                severity: None,
                resolved: false,
            }],
            photos: Vec::<PhotoView>::new(),
        }
    }

    #[tokio::test]
    async fn paired_return_renders_comparison() {
        let renderer = FakePdfRenderer::default();
        let delivery = view(InspectionKind::Delivery);
        let (bytes, comparison) =
            render_document(&renderer, &view(InspectionKind::Return), Some(&delivery))
                .await
                .expect("pdf");
        assert!(comparison);
        assert!(String::from_utf8_lossy(&bytes).contains("Delivery / return comparison"));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn comparison_failure_falls_back_to_single_pdf() {
        let renderer = FakePdfRenderer {
            fail_marker: Some("Delivery / return comparison".to_string()),
            ..FakePdfRenderer::default()
        };
        let delivery = view(InspectionKind::Delivery);
        let (bytes, comparison) =
            render_document(&renderer, &view(InspectionKind::Return), Some(&delivery))
                .await
                .expect("fallback pdf");
        assert!(!comparison);
        assert!(bytes.starts_with(b"%PDF"));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn single_failure_is_reported() {
        let renderer = FakePdfRenderer {
            fail_marker: Some("Delivery inspection".to_string()),
            ..FakePdfRenderer::default()
        };
        assert!(render_document(&renderer, &view(InspectionKind::Delivery), None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unreadable_photos_are_skipped() {
        let state = AppState::for_tests();
        state
            .storage
            .put("org/inspections/i1/front.jpg", vec![1, 2, 3], "image/jpeg")
            .await
            .expect("put");
        let photo = |id: &str, key: &str| InspectionPhoto {
            id: id.to_string(),
            inspection_id: "i1".to_string(),
            storage_key: key.to_string(),
            mime_type: None,
            label: Some(id.to_string()),
        };
        let photos = vec![
            photo("front", "org/inspections/i1/front.jpg"),
            photo("rear", "org/inspections/i1/missing.jpg"),
        ];

        let views = embed_photos(&state, "i1", &photos).await;
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].label.as_deref(), Some("front"));
        assert!(views[0].data_uri.starts_with("data:image/jpeg;base64,"));
    }

    #[test]
    fn recipient_override_wins_over_customer_email() {
        let customer: Customer = serde_json::from_value(json!({
            "id": "c1",
            "organization_id": "o1",
            "full_name": "Ana Ruiz",
            "email": "ana@example.com",
        }))
        .expect("customer");
        assert_eq!(resolve_recipient(None, &customer).expect("email"), "ana@example.com");
        assert_eq!(
            resolve_recipient(Some(" ops@example.com "), &customer).expect("override"),
            "ops@example.com"
        );

        let no_email = Customer { email: None, ..customer };
        assert!(resolve_recipient(Some("  "), &no_email).is_err());
    }
}
