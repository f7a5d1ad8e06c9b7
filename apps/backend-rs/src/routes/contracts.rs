use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    db::{acquire, begin, commit, db_pool},
    error::{AppError, AppResult},
    models::{from_row, BookingStatus, Contract},
    repository::table_service::{get_row, list_rows, lock_row, update_row},
    routes::inspections::pdf_response,
    schemas::{
        validate_input, value_str, BookingPath, ContractPath, PublicSignInput, SendDocumentInput,
        SignContractInput, SigningLinkInput,
    },
    services::{
        audit::{write_audit_log, write_audit_log_tx, AuditEntry},
        booking_data::{load_booking, load_customer, load_organization},
        contracts::{
            decode_signature_png, ensure_contract_tx, hash_signing_token, issue_signing_token,
            render_contract_pdf, signature_patch,
        },
        email::{send_with_retry, EmailAttachment, EmailMessage},
        inspection_report::resolve_recipient,
        templates::escape_html,
    },
    state::AppState,
    tenancy::{assert_org_member, assert_org_role, row_org_id, FRONT_DESK_ROLES},
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/bookings/{booking_id}/contract",
            axum::routing::post(create_contract),
        )
        .route("/contracts/{contract_id}", axum::routing::get(get_contract))
        .route(
            "/contracts/{contract_id}/sign",
            axum::routing::post(sign_contract),
        )
        .route(
            "/contracts/{contract_id}/pdf",
            axum::routing::get(contract_pdf),
        )
        .route(
            "/contracts/{contract_id}/send",
            axum::routing::post(send_contract),
        )
        .route(
            "/contracts/{contract_id}/signing-link",
            axum::routing::post(create_signing_link),
        )
        .route(
            "/public/contracts/sign",
            axum::routing::post(public_sign_contract),
        )
}

fn contract_file_name(contract: &Contract) -> String {
    format!("contract-{}.pdf", contract.contract_number)
}

fn signing_url(base: &str, token: &str) -> String {
    format!("{}/sign/{token}", base.trim_end_matches('/'))
}

fn check_token_expiry(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<(), AppError> {
    match expires_at {
        Some(expires_at) if expires_at > now => Ok(()),
        _ => Err(AppError::Gone("This signing link has expired.".to_string())),
    }
}

async fn create_contract(
    State(state): State<AppState>,
    Path(path): Path<BookingPath>,
    headers: HeaderMap,
) -> AppResult<impl IntoResponse> {
    let user_id = require_user_id(&state, &headers).await?;

    let mut tx = begin(&state).await?;
    let (_, booking) = load_booking(&mut tx, &path.booking_id).await?;
    let ctx = assert_org_role(&state, &user_id, &booking.organization_id, FRONT_DESK_ROLES).await?;
    if booking.status == BookingStatus::Cancelled {
        return Err(AppError::Conflict(
            "A cancelled booking cannot get a contract.".to_string(),
        ));
    }
    lock_row(&mut tx, "bookings", &booking.id, "id").await?;

    let contract = ensure_contract_tx(&mut tx, &booking, Utc::now()).await?;
    let contract_id = value_str(&contract, "id");
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "ensure", "contracts", &contract_id).after(contract.clone()),
    )
    .await?;
    commit(tx).await?;
    Ok((StatusCode::CREATED, Json(contract)))
}

async fn get_contract(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers).await?;
    let row = get_row(db_pool(&state)?, "contracts", &path.contract_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&row)?).await?;
    Ok(Json(without_token(row)))
}

fn without_token(mut row: Value) -> Value {
    if let Some(obj) = row.as_object_mut() {
        obj.remove("signing_token_hash");
    }
    row
}

async fn sign_contract(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
    headers: HeaderMap,
    Json(payload): Json<SignContractInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let signature = payload
        .signature_png_base64
        .as_deref()
        .map(decode_signature_png)
        .transpose()?;

    let mut tx = begin(&state).await?;
    let before = lock_row(&mut tx, "contracts", &path.contract_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&before)?, FRONT_DESK_ROLES).await?;
    let contract: Contract = from_row(&before, "contracts")?;

    let patch = signature_patch(&state, &contract, &payload.signer_name, signature, Some(&ctx.user_id)).await?;
    let updated = update_row(&mut *tx, "contracts", &contract.id, &patch, "id").await?;
    write_audit_log_tx(
        &mut tx,
        AuditEntry::new(&ctx, "sign", "contracts", &contract.id)
            .before(before)
            .after(updated.clone()),
    )
    .await?;
    commit(tx).await?;
    Ok(Json(without_token(updated)))
}

async fn contract_pdf(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
    headers: HeaderMap,
) -> AppResult<Response> {
    let user_id = require_user_id(&state, &headers).await?;
    let mut conn = acquire(&state).await?;
    let row = get_row(&mut *conn, "contracts", &path.contract_id, "id").await?;
    assert_org_member(&state, &user_id, &row_org_id(&row)?).await?;
    let contract: Contract = from_row(&row, "contracts")?;

    let (bytes, _) = render_contract_pdf(&state, &mut conn, &contract).await?;
    Ok(pdf_response(bytes, &contract_file_name(&contract)))
}

async fn send_contract(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
    headers: HeaderMap,
    payload: Option<Json<SendDocumentInput>>,
) -> AppResult<Json<Value>> {
    let payload = payload.map(|Json(input)| input).unwrap_or_default();
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let mailer = state.mailer()?;

    let mut conn = acquire(&state).await?;
    let row = get_row(&mut *conn, "contracts", &path.contract_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&row)?, FRONT_DESK_ROLES).await?;
    let contract: Contract = from_row(&row, "contracts")?;

    let (bytes, booking) = render_contract_pdf(&state, &mut conn, &contract).await?;
    let customer = load_customer(&mut conn, &booking.customer_id).await?;
    let organization = load_organization(&mut conn, &contract.organization_id).await?;
    let recipient = resolve_recipient(payload.recipient.as_deref(), &customer)?;
    let file_name = contract_file_name(&contract);

    let message = EmailMessage {
        to: recipient.clone(),
        subject: format!("{} · rental contract {}", organization.name, contract.contract_number),
        html: format!(
            "<p>Hello {},</p><p>Please find attached your rental contract {}.</p><p>{}</p>",
            escape_html(customer.first_name()),
            escape_html(&contract.contract_number),
            escape_html(&organization.name)
        ),
        text: None,
        attachments: vec![EmailAttachment {
            file_name: file_name.clone(),
            content_type: "application/pdf".to_string(),
            bytes,
        }],
        admin_copy: true,
    };
    send_with_retry(mailer, &state.config, &message).await?;

    let mut patch = Map::new();
    patch.insert("sent_at".to_string(), json!(Utc::now().to_rfc3339()));
    update_row(&mut *conn, "contracts", &contract.id, &patch, "id").await?;

    let outcome = json!({ "recipient": recipient, "file_name": file_name });
    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "send", "contracts", &contract.id).after(outcome.clone()),
    )
    .await;
    Ok(Json(outcome))
}

async fn create_signing_link(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
    headers: HeaderMap,
    payload: Option<Json<SigningLinkInput>>,
) -> AppResult<impl IntoResponse> {
    let payload = payload.map(|Json(input)| input).unwrap_or_default();
    validate_input(&payload)?;
    let user_id = require_user_id(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let row = get_row(pool, "contracts", &path.contract_id, "id").await?;
    let ctx = assert_org_role(&state, &user_id, &row_org_id(&row)?, FRONT_DESK_ROLES).await?;
    let contract: Contract = from_row(&row, "contracts")?;
    if contract.signed_at.is_some() {
        return Err(AppError::Conflict("Contract is already signed.".to_string()));
    }

    let (token, hash) = issue_signing_token();
    let expires_at = Utc::now() + Duration::hours(payload.expires_in_hours);
    let mut patch = Map::new();
    patch.insert("signing_token_hash".to_string(), json!(hash));
    patch.insert("signing_token_expires_at".to_string(), json!(expires_at.to_rfc3339()));
    update_row(pool, "contracts", &contract.id, &patch, "id").await?;

    write_audit_log(
        state.db_pool.as_ref(),
        AuditEntry::new(&ctx, "issue_signing_link", "contracts", &contract.id)
            .after(json!({ "expires_at": expires_at })),
    )
    .await;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "token": token,
            "url": signing_url(&state.config.app_public_url, &token),
            "expires_at": expires_at,
        })),
    ))
}

async fn public_sign_contract(
    State(state): State<AppState>,
    Json(payload): Json<PublicSignInput>,
) -> AppResult<Json<Value>> {
    validate_input(&payload)?;
    let signature = decode_signature_png(&payload.signature_png_base64)?;

    let mut filters = Map::new();
    filters.insert(
        "signing_token_hash".to_string(),
        json!(hash_signing_token(&payload.token)),
    );
    let mut tx = begin(&state).await?;
    let found = list_rows(&mut *tx, "contracts", Some(&filters), 1, 0, "created_at", true)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| AppError::NotFound("Signing link not found.".to_string()))?;
    let before = lock_row(&mut tx, "contracts", &value_str(&found, "id"), "id").await?;
    let expires_at = before
        .get("signing_token_expires_at")
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|at| at.with_timezone(&Utc));
    check_token_expiry(expires_at, Utc::now())?;

    let contract: Contract = from_row(&before, "contracts")?;
    let patch = signature_patch(&state, &contract, &payload.signer_name, Some(signature), None).await?;
    let updated = update_row(&mut *tx, "contracts", &contract.id, &patch, "id").await?;
    write_audit_log_tx(
        &mut tx,
        AuditEntry::public(&contract.organization_id, "public_sign", "contracts", &contract.id)
            .after(json!({ "signer_name": payload.signer_name.trim() })),
    )
    .await?;
    commit(tx).await?;

    tracing::info!(contract_id = %contract.id, "Contract signed through public link");
    Ok(Json(json!({
        "contract_number": value_str(&updated, "contract_number"),
        "signed_at": updated.get("signed_at").cloned().unwrap_or(Value::Null),
    })))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use chrono::{Duration, TimeZone, Utc};
    use serde_json::json;
    use tower::ServiceExt;

    use super::{check_token_expiry, router, signing_url, without_token};
    use crate::state::AppState;

    #[test]
    fn signing_urls_join_cleanly() {
        assert_eq!(
            signing_url("https://app.example.com/", "abc"),
            "https://app.example.com/sign/abc"
        );
    }

    #[test]
    fn expired_or_missing_expiry_is_gone() {
        let now = Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).single().expect("now");
        assert!(check_token_expiry(Some(now + Duration::minutes(1)), now).is_ok());
        assert!(check_token_expiry(Some(now), now).is_err());
        assert!(check_token_expiry(None, now).is_err());
    }

    #[test]
    fn token_hash_never_leaves_the_api() {
        let row = without_token(json!({ "id": "k1", "signing_token_hash": "deadbeef" }));
        assert!(row.get("signing_token_hash").is_none());
    }

    #[tokio::test]
    async fn public_signing_rejects_short_tokens() {
        let response = router()
            .with_state(AppState::for_tests())
            .oneshot(
                Request::post("/public/contracts/sign")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"token":"short","signer_name":"Ana","signature_png_base64":"iVBORw0KGgo="}"#,
                    ))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
