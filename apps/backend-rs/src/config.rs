use std::env;

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from_address: String,
    pub admin_copy: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub app_name: String,
    pub environment: String,
    pub api_prefix: String,
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub trusted_hosts: Vec<String>,
    pub dev_auth_overrides_enabled: bool,
    pub rate_limit_per_second: u64,
    pub rate_limit_burst_size: u32,
    pub database_url: Option<String>,
    pub db_pool_max_connections: u32,
    pub db_pool_min_connections: u32,
    pub db_pool_acquire_timeout_seconds: u64,
    pub db_pool_idle_timeout_seconds: u64,
    pub db_run_migrations: bool,
    pub jwt_secret: Option<String>,
    pub org_membership_cache_ttl_seconds: u64,
    pub org_membership_cache_max_entries: u64,
    pub smtp: Option<SmtpSettings>,
    pub email_max_attempts: u32,
    pub email_retry_base_ms: u64,
    pub storage_bucket: Option<String>,
    pub storage_local_dir: String,
    pub pdf_renderer_bin: String,
    pub pdf_render_timeout_seconds: u64,
    pub default_timezone: String,
    pub default_currency: String,
    pub vat_rate_percent: f64,
    pub pickup_grace_minutes: i64,
    pub app_public_url: String,
    pub review_url: Option<String>,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self {
            app_name: env_or("APP_NAME", "Fleetdesk API"),
            environment: env_or("ENVIRONMENT", "development"),
            api_prefix: normalize_prefix(&env_or("API_PREFIX", "/v1")),
            host: env_or("HOST", "0.0.0.0"),
            port: env_parse_or("PORT", 8000),
            cors_origins: parse_csv(&env_or("CORS_ORIGINS", "http://localhost:3000")),
            trusted_hosts: parse_csv(&env_or("TRUSTED_HOSTS", "localhost,127.0.0.1")),
            dev_auth_overrides_enabled: env_parse_bool_or("DEV_AUTH_OVERRIDES_ENABLED", false),
            rate_limit_per_second: env_parse_or("RATE_LIMIT_PER_SECOND", 10),
            rate_limit_burst_size: env_parse_or("RATE_LIMIT_BURST_SIZE", 100),
            database_url: env_opt("DATABASE_URL"),
            db_pool_max_connections: env_parse_or("DB_POOL_MAX_CONNECTIONS", 5),
            db_pool_min_connections: env_parse_or("DB_POOL_MIN_CONNECTIONS", 1),
            db_pool_acquire_timeout_seconds: env_parse_or("DB_POOL_ACQUIRE_TIMEOUT_SECONDS", 5),
            db_pool_idle_timeout_seconds: env_parse_or("DB_POOL_IDLE_TIMEOUT_SECONDS", 600),
            db_run_migrations: env_parse_bool_or("DB_RUN_MIGRATIONS", false),
            jwt_secret: env_opt("JWT_SECRET"),
            org_membership_cache_ttl_seconds: env_parse_or("ORG_MEMBERSHIP_CACHE_TTL_SECONDS", 30),
            org_membership_cache_max_entries: env_parse_or(
                "ORG_MEMBERSHIP_CACHE_MAX_ENTRIES",
                10000,
            ),
            smtp: smtp_from_env(),
            email_max_attempts: env_parse_or("EMAIL_MAX_ATTEMPTS", 3),
            email_retry_base_ms: env_parse_or("EMAIL_RETRY_BASE_MS", 1000),
            storage_bucket: env_opt("STORAGE_BUCKET"),
            storage_local_dir: env_or("STORAGE_LOCAL_DIR", "./storage"),
            pdf_renderer_bin: env_or("PDF_RENDERER_BIN", "wkhtmltopdf"),
            pdf_render_timeout_seconds: env_parse_or("PDF_RENDER_TIMEOUT_SECONDS", 20),
            default_timezone: env_or("DEFAULT_TIMEZONE", "Europe/Madrid"),
            default_currency: env_or("DEFAULT_CURRENCY", "EUR"),
            vat_rate_percent: env_parse_or("VAT_RATE_PERCENT", 21.0),
            pickup_grace_minutes: env_parse_or("PICKUP_GRACE_MINUTES", 59),
            app_public_url: env_or("APP_PUBLIC_URL", "http://localhost:3000"),
            review_url: env_opt("REVIEW_URL"),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.trim().eq_ignore_ascii_case("production")
    }

    pub fn auth_dev_overrides_enabled(&self) -> bool {
        if self.is_production() {
            return false;
        }
        self.dev_auth_overrides_enabled
    }

    pub fn email_enabled(&self) -> bool {
        self.smtp.is_some()
    }
}

fn smtp_from_env() -> Option<SmtpSettings> {
    let host = env_opt("SMTP_HOST")?;
    Some(SmtpSettings {
        host,
        port: env_parse_or("SMTP_PORT", 587),
        user: env_opt("SMTP_USER"),
        password: env_opt("SMTP_PASSWORD"),
        from_address: env_or("SMTP_FROM", "noreply@fleetdesk.app"),
        admin_copy: env_opt("SMTP_ADMIN_COPY"),
    })
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_opt(key).unwrap_or_else(|| default.to_string())
}

fn env_parse_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    env_opt(key)
        .and_then(|raw| raw.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_parse_bool_or(key: &str, default: bool) -> bool {
    match env_opt(key).as_deref().map(str::to_ascii_lowercase) {
        Some(value) if value == "1" || value == "true" || value == "yes" || value == "on" => true,
        Some(value) if value == "0" || value == "false" || value == "no" || value == "off" => false,
        Some(_) => default,
        None => default,
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

fn normalize_prefix(raw: &str) -> String {
    let mut prefix = raw.trim().to_string();
    if prefix.is_empty() {
        return "/v1".to_string();
    }
    if !prefix.starts_with('/') {
        prefix.insert(0, '/');
    }
    while prefix.ends_with('/') && prefix.len() > 1 {
        prefix.pop();
    }
    prefix
}

#[cfg(test)]
impl AppConfig {
    /// Configuration with no database, SMTP or bucket, for router tests.
    pub fn for_tests() -> Self {
        Self {
            app_name: "Fleetdesk API".to_string(),
            environment: "test".to_string(),
            api_prefix: "/v1".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            cors_origins: vec!["http://localhost:3000".to_string()],
            trusted_hosts: vec!["localhost".to_string()],
            dev_auth_overrides_enabled: true,
            rate_limit_per_second: 10,
            rate_limit_burst_size: 100,
            database_url: None,
            db_pool_max_connections: 1,
            db_pool_min_connections: 0,
            db_pool_acquire_timeout_seconds: 1,
            db_pool_idle_timeout_seconds: 60,
            db_run_migrations: false,
            jwt_secret: Some("test-secret".to_string()),
            org_membership_cache_ttl_seconds: 30,
            org_membership_cache_max_entries: 100,
            smtp: None,
            email_max_attempts: 3,
            email_retry_base_ms: 1,
            storage_bucket: None,
            storage_local_dir: std::env::temp_dir()
                .join("fleetdesk-test-storage")
                .to_string_lossy()
                .into_owned(),
            pdf_renderer_bin: "wkhtmltopdf".to_string(),
            pdf_render_timeout_seconds: 5,
            default_timezone: "Europe/Madrid".to_string(),
            default_currency: "EUR".to_string(),
            vat_rate_percent: 21.0,
            pickup_grace_minutes: 59,
            app_public_url: "http://localhost:3000".to_string(),
            review_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_prefix, parse_csv};

    #[test]
    fn normalizes_prefix() {
        assert_eq!(normalize_prefix("v1"), "/v1");
        assert_eq!(normalize_prefix("/v1/"), "/v1");
        assert_eq!(normalize_prefix(""), "/v1");
    }

    #[test]
    fn parses_csv_lists() {
        assert_eq!(
            parse_csv(" a.example.com, ,b.example.com "),
            vec!["a.example.com".to_string(), "b.example.com".to_string()]
        );
        assert!(parse_csv("").is_empty());
    }
}
