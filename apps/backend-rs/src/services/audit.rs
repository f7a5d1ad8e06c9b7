use serde_json::Value;
use sqlx::{Executor, PgPool, Postgres};

use crate::{error::AppError, tenancy::OrgContext};

#[derive(Debug, Clone)]
pub struct AuditEntry<'a> {
    pub org_id: Option<&'a str>,
    pub actor_user_id: Option<&'a str>,
    pub action: &'a str,
    pub entity_name: &'a str,
    pub entity_id: Option<&'a str>,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl<'a> AuditEntry<'a> {
    pub fn new(ctx: &'a OrgContext, action: &'a str, entity_name: &'a str, entity_id: &'a str) -> Self {
        Self {
            org_id: Some(&ctx.org_id),
            actor_user_id: Some(&ctx.user_id),
            action,
            entity_name,
            entity_id: Some(entity_id),
            before: None,
            after: None,
        }
    }

    /// Entry for an anonymous caller, e.g. the public booking widget.
    pub fn public(org_id: &'a str, action: &'a str, entity_name: &'a str, entity_id: &'a str) -> Self {
        Self {
            org_id: Some(org_id),
            actor_user_id: None,
            action,
            entity_name,
            entity_id: Some(entity_id),
            before: None,
            after: None,
        }
    }

    pub fn before(mut self, value: Value) -> Self {
        self.before = Some(value);
        self
    }

    pub fn after(mut self, value: Value) -> Self {
        self.after = Some(value);
        self
    }
}

async fn insert_entry<'c, E>(executor: E, entry: &AuditEntry<'_>) -> Result<(), sqlx::Error>
where
    E: Executor<'c, Database = Postgres>,
{
    sqlx::query(
        "INSERT INTO audit_logs
           (organization_id, actor_user_id, action, entity_name, entity_id, before_state, after_state)
         VALUES ($1::uuid, $2::uuid, $3, $4, $5, $6, $7)",
    )
    .bind(entry.org_id)
    .bind(entry.actor_user_id)
    .bind(entry.action)
    .bind(entry.entity_name)
    .bind(entry.entity_id)
    .bind(entry.before.clone())
    .bind(entry.after.clone())
    .execute(executor)
    .await?;
    Ok(())
}

/// Best effort: a failed audit write is logged and never fails the request.
pub async fn write_audit_log(pool: Option<&PgPool>, entry: AuditEntry<'_>) {
    let Some(pool) = pool else {
        return;
    };
    if let Err(error) = insert_entry(pool, &entry).await {
        tracing::warn!(
            action = entry.action,
            entity = entry.entity_name,
            entity_id = entry.entity_id.unwrap_or_default(),
            error = %error,
            "Audit log write failed"
        );
    }
}

/// Audit write that commits or rolls back with the surrounding transaction.
pub async fn write_audit_log_tx(
    conn: &mut sqlx::PgConnection,
    entry: AuditEntry<'_>,
) -> Result<(), AppError> {
    insert_entry(&mut *conn, &entry).await.map_err(|error| {
        tracing::error!(action = entry.action, entity = entry.entity_name, error = %error, "Audit log write failed");
        AppError::Dependency("Database operation failed.".to_string())
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{write_audit_log, AuditEntry};
    use crate::tenancy::OrgContext;

    #[test]
    fn entries_carry_context() {
        let ctx = OrgContext {
            user_id: "user-1".to_string(),
            org_id: "org-1".to_string(),
            role: "operator".to_string(),
        };
        let entry = AuditEntry::new(&ctx, "update", "bookings", "b-1")
            .before(json!({"status": "pending"}))
            .after(json!({"status": "confirmed"}));
        assert_eq!(entry.org_id, Some("org-1"));
        assert_eq!(entry.actor_user_id, Some("user-1"));
        assert_eq!(entry.after, Some(json!({"status": "confirmed"})));

        let public = AuditEntry::public("org-1", "create", "bookings", "b-2");
        assert!(public.actor_user_id.is_none());
    }

    #[tokio::test]
    async fn missing_pool_is_a_no_op() {
        write_audit_log(None, AuditEntry::public("org", "create", "bookings", "b")).await;
    }
}
