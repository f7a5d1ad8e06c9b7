use serde_json::Value;
use sqlx::Row;

use crate::{db::db_pool, error::AppError, state::AppState};

pub const ROLE_OWNER_ADMIN: &str = "owner_admin";
pub const ROLE_OPERATOR: &str = "operator";
pub const ROLE_ACCOUNTANT: &str = "accountant";

/// Roles that run the counter: bookings, payments, inspections.
pub const FRONT_DESK_ROLES: &[&str] = &[ROLE_OWNER_ADMIN, ROLE_OPERATOR];
pub const FINANCE_ROLES: &[&str] = &[ROLE_OWNER_ADMIN, ROLE_OPERATOR, ROLE_ACCOUNTANT];
pub const ADMIN_ROLES: &[&str] = &[ROLE_OWNER_ADMIN];

/// The caller and the organization a request acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgContext {
    pub user_id: String,
    pub org_id: String,
    pub role: String,
}

impl OrgContext {
    pub fn is_admin(&self) -> bool {
        self.role == ROLE_OWNER_ADMIN
    }
}

async fn load_membership_role(
    state: &AppState,
    user_id: &str,
    org_id: &str,
) -> Result<Option<String>, AppError> {
    let cache_key = (user_id.to_string(), org_id.to_string());
    if let Some(role) = state.org_membership_cache.get(&cache_key).await {
        return Ok(Some(role));
    }

    let pool = db_pool(state)?;
    let row = sqlx::query(
        "SELECT role::text AS role
         FROM organization_members
         WHERE organization_id = $1::uuid AND user_id = $2::uuid
         LIMIT 1",
    )
    .bind(org_id)
    .bind(user_id)
    .fetch_optional(pool)
    .await
    .map_err(|error| {
        tracing::error!(org_id, user_id, error = %error, "Membership lookup failed");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    let role = row.and_then(|row| row.try_get::<String, _>("role").ok());
    if let Some(role) = &role {
        state
            .org_membership_cache
            .insert(cache_key, role.clone())
            .await;
    }
    Ok(role)
}

pub async fn assert_org_member(
    state: &AppState,
    user_id: &str,
    org_id: &str,
) -> Result<OrgContext, AppError> {
    if uuid::Uuid::parse_str(org_id.trim()).is_err() {
        return Err(AppError::BadRequest("org_id must be a UUID.".to_string()));
    }
    let role = load_membership_role(state, user_id, org_id)
        .await?
        .ok_or_else(|| {
            AppError::Forbidden("Forbidden: not a member of this organization.".to_string())
        })?;
    Ok(OrgContext {
        user_id: user_id.to_string(),
        org_id: org_id.trim().to_string(),
        role,
    })
}

pub async fn assert_org_role(
    state: &AppState,
    user_id: &str,
    org_id: &str,
    allowed_roles: &[&str],
) -> Result<OrgContext, AppError> {
    let context = assert_org_member(state, user_id, org_id).await?;
    ensure_role(&context, allowed_roles)?;
    Ok(context)
}

pub fn ensure_role(context: &OrgContext, allowed_roles: &[&str]) -> Result<(), AppError> {
    if allowed_roles.contains(&context.role.as_str()) {
        return Ok(());
    }
    Err(AppError::Forbidden(format!(
        "Forbidden: role '{}' is not allowed for this action.",
        context.role
    )))
}

/// Org id of a stored row, for routes addressed by a child id only.
pub fn row_org_id(row: &Value) -> Result<String, AppError> {
    row.get("organization_id")
        .and_then(Value::as_str)
        .map(ToOwned::to_owned)
        .ok_or_else(|| AppError::Internal("Record has no organization.".to_string()))
}

pub async fn ensure_app_user(
    state: &AppState,
    user_id: &str,
    email: Option<&str>,
) -> Result<(), AppError> {
    let pool = db_pool(state)?;
    sqlx::query(
        "INSERT INTO app_users (id, email)
         VALUES ($1::uuid, $2)
         ON CONFLICT (id) DO UPDATE SET email = COALESCE(EXCLUDED.email, app_users.email)",
    )
    .bind(user_id)
    .bind(email)
    .execute(pool)
    .await
    .map_err(|error| {
        tracing::error!(user_id, error = %error, "Could not upsert app user");
        AppError::Dependency("Database operation failed.".to_string())
    })?;
    Ok(())
}

pub async fn list_user_organizations(
    state: &AppState,
    user_id: &str,
) -> Result<Vec<Value>, AppError> {
    let pool = db_pool(state)?;
    let rows = sqlx::query(
        "SELECT row_to_json(o)::jsonb || jsonb_build_object('role', m.role::text) AS row
         FROM organization_members m
         JOIN organizations o ON o.id = m.organization_id
         WHERE m.user_id = $1::uuid
         ORDER BY o.name
         LIMIT 500",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(|error| {
        tracing::error!(user_id, error = %error, "Could not list organizations");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    Ok(rows
        .into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect())
}

pub async fn add_org_member(
    conn: &mut sqlx::PgConnection,
    org_id: &str,
    user_id: &str,
    role: &str,
) -> Result<(), AppError> {
    sqlx::query(
        "INSERT INTO organization_members (organization_id, user_id, role)
         VALUES ($1::uuid, $2::uuid, $3)
         ON CONFLICT (organization_id, user_id) DO UPDATE SET role = EXCLUDED.role",
    )
    .bind(org_id)
    .bind(user_id)
    .bind(role)
    .execute(&mut *conn)
    .await
    .map_err(|error| {
        tracing::error!(org_id, user_id, error = %error, "Could not add organization member");
        AppError::Dependency("Database operation failed.".to_string())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{assert_org_member, ensure_role, OrgContext, ADMIN_ROLES, FINANCE_ROLES};
    use crate::state::AppState;

    fn context(role: &str) -> OrgContext {
        OrgContext {
            user_id: "u".to_string(),
            org_id: "o".to_string(),
            role: role.to_string(),
        }
    }

    #[test]
    fn role_checks() {
        assert!(ensure_role(&context("accountant"), FINANCE_ROLES).is_ok());
        assert!(ensure_role(&context("operator"), ADMIN_ROLES).is_err());
        assert!(context("owner_admin").is_admin());
    }

    #[tokio::test]
    async fn cached_membership_skips_database() {
        let state = AppState::for_tests();
        let org = "550e8400-e29b-41d4-a716-446655440000";
        state
            .org_membership_cache
            .insert(("user-1".to_string(), org.to_string()), "operator".to_string())
            .await;
        let ctx = assert_org_member(&state, "user-1", org).await.expect("cached");
        assert_eq!(ctx.role, "operator");

        // Uncached and no pool configured.
        let error = assert_org_member(&state, "user-2", org).await.expect_err("no db");
        assert_eq!(error.status_code(), axum::http::StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn rejects_malformed_org_ids() {
        let state = AppState::for_tests();
        let error = assert_org_member(&state, "user-1", "acme").await.expect_err("bad id");
        assert_eq!(error.status_code(), axum::http::StatusCode::BAD_REQUEST);
    }
}
