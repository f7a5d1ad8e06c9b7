use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;
use serde_json::Value;
use sqlx::PgPool;

use crate::{
    config::AppConfig,
    db::build_pool,
    error::AppError,
    services::{
        email::{Mailer, SmtpMailer},
        pdf::{CommandPdfRenderer, PdfRenderer},
        storage::{LocalStorage, ObjectStorage, S3Storage},
    },
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db_pool: Option<PgPool>,
    pub http_client: reqwest::Client,
    /// `(user_id, org_id)` → membership role.
    pub org_membership_cache: Cache<(String, String), String>,
    /// Organization rows keyed by public slug for the booking widget.
    pub public_org_cache: Cache<String, Value>,
    pub storage: Arc<dyn ObjectStorage>,
    pub mailer: Option<Arc<dyn Mailer>>,
    pub pdf_renderer: Arc<dyn PdfRenderer>,
}

impl AppState {
    pub async fn build(config: AppConfig) -> Result<Self, AppError> {
        let db_pool = build_pool(&config).map_err(|error| {
            AppError::Internal(format!("Could not configure database pool: {error}"))
        })?;
        match db_pool.as_ref() {
            Some(pool) if config.db_run_migrations => {
                sqlx::migrate!("./migrations").run(pool).await.map_err(|error| {
                    AppError::Internal(format!("Could not apply migrations: {error}"))
                })?;
                tracing::info!("Database migrations applied");
            }
            Some(_) => {}
            None => tracing::warn!("DATABASE_URL is not set; data endpoints will return 502"),
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|error| AppError::Internal(format!("Could not build HTTP client: {error}")))?;

        let storage: Arc<dyn ObjectStorage> = match config.storage_bucket.clone() {
            Some(bucket) => {
                let aws_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
                let client = aws_sdk_s3::Client::new(&aws_config);
                tracing::info!(bucket = %bucket, "Using S3 object storage");
                Arc::new(S3Storage::new(client, bucket))
            }
            None => {
                tracing::info!(dir = %config.storage_local_dir, "Using local object storage");
                Arc::new(LocalStorage::new(config.storage_local_dir.clone()))
            }
        };

        let mailer: Option<Arc<dyn Mailer>> = match config.smtp.clone() {
            Some(settings) => Some(Arc::new(SmtpMailer::new(settings)?)),
            None => {
                tracing::warn!("SMTP is not configured; document emails are disabled");
                None
            }
        };

        let pdf_renderer = Arc::new(CommandPdfRenderer::new(
            config.pdf_renderer_bin.clone(),
            Duration::from_secs(config.pdf_render_timeout_seconds),
        ));

        Ok(Self {
            org_membership_cache: membership_cache(&config),
            public_org_cache: Cache::builder()
                .max_capacity(1_000)
                .time_to_live(Duration::from_secs(60))
                .build(),
            config: Arc::new(config),
            db_pool,
            http_client,
            storage,
            mailer,
            pdf_renderer,
        })
    }

    pub fn mailer(&self) -> Result<&dyn Mailer, AppError> {
        self.mailer.as_deref().ok_or_else(|| {
            AppError::Dependency("Email is not configured. Set SMTP_HOST.".to_string())
        })
    }
}

fn membership_cache(config: &AppConfig) -> Cache<(String, String), String> {
    Cache::builder()
        .max_capacity(config.org_membership_cache_max_entries)
        .time_to_live(Duration::from_secs(config.org_membership_cache_ttl_seconds))
        .build()
}

#[cfg(test)]
impl AppState {
    /// No database; in-memory storage, recording mailer and fake PDF renderer.
    pub fn for_tests() -> Self {
        use crate::services::{
            email::mock::MockMailer, pdf::fake::FakePdfRenderer, storage::memory::MemoryStorage,
        };

        let config = AppConfig::for_tests();
        Self {
            org_membership_cache: membership_cache(&config),
            public_org_cache: Cache::builder().max_capacity(10).build(),
            config: Arc::new(config),
            db_pool: None,
            http_client: reqwest::Client::new(),
            storage: Arc::new(MemoryStorage::default()),
            mailer: Some(Arc::new(MockMailer::default())),
            pdf_renderer: Arc::new(FakePdfRenderer::default()),
        }
    }
}
