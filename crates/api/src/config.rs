//! Server configuration loaded from the environment

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Postgres connection string
    pub database_url: String,
    /// Direct (non-pooler) connection string for migrations, if different
    pub database_direct_url: Option<String>,
    /// Address the HTTP server binds to
    pub bind_address: String,
    /// Endpoint secret for verifying billing provider webhooks
    pub webhook_secret: String,
    /// Bearer token required on admin endpoints
    pub admin_token: String,
    /// Worst-case token estimate used to gate admission before a completion
    pub max_tokens_estimate: i64,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
        let webhook_secret = std::env::var("BILLING_WEBHOOK_SECRET")
            .map_err(|_| anyhow::anyhow!("BILLING_WEBHOOK_SECRET must be set"))?;
        let admin_token = std::env::var("ADMIN_TOKEN")
            .map_err(|_| anyhow::anyhow!("ADMIN_TOKEN must be set"))?;

        let database_direct_url = std::env::var("DATABASE_DIRECT_URL").ok();
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let max_tokens_estimate = std::env::var("MAX_TOKENS_ESTIMATE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1_000);

        if admin_token.len() < 16 {
            anyhow::bail!("ADMIN_TOKEN must be at least 16 characters");
        }

        Ok(Self {
            database_url,
            database_direct_url,
            bind_address,
            webhook_secret,
            admin_token,
            max_tokens_estimate,
        })
    }
}
