//! API server configuration

use anyhow::{bail, Context};

/// Server configuration loaded from environment
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    /// Absent in dev mode: billing runs on the in-memory store
    pub database_url: Option<String>,
    /// HS256 secret of user access tokens
    pub jwt_secret: String,
    /// Bearer token expected on `/api/cron/*`
    pub cron_secret: String,
    /// Bearer token expected on `/api/admin/*`
    pub admin_secret: String,
    pub allowed_origins: Vec<String>,
}

fn required(key: &str) -> anyhow::Result<String> {
    let value = std::env::var(key).with_context(|| format!("{} is not set", key))?;
    if value.trim().is_empty() {
        bail!("{} is empty", key);
    }
    Ok(value)
}

fn optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let cron_secret = required("CRON_SECRET")?;
        let admin_secret = required("ADMIN_API_SECRET")?;
        // a shared secret would let the cron caller reach admin routes
        if cron_secret == admin_secret {
            bail!("CRON_SECRET and ADMIN_API_SECRET must differ");
        }

        Ok(Self {
            bind_address: optional("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            database_url: optional("DATABASE_URL"),
            jwt_secret: required("JWT_SECRET")?,
            cron_secret,
            admin_secret,
            allowed_origins: optional("ALLOWED_ORIGINS")
                .unwrap_or_else(|| "http://localhost:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn set_required() {
        std::env::set_var("CRON_SECRET", "cron-secret");
        std::env::set_var("ADMIN_API_SECRET", "admin-secret");
        std::env::set_var("JWT_SECRET", "jwt-secret");
    }

    #[test]
    #[serial]
    fn test_defaults_applied() {
        set_required();
        std::env::remove_var("BIND_ADDRESS");
        std::env::remove_var("DATABASE_URL");
        std::env::set_var("ALLOWED_ORIGINS", "https://a.example, https://b.example");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert!(config.database_url.is_none());
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        std::env::remove_var("ALLOWED_ORIGINS");
    }

    #[test]
    #[serial]
    fn test_missing_or_shared_secrets_rejected() {
        set_required();
        std::env::remove_var("JWT_SECRET");
        assert!(Config::from_env().is_err());

        set_required();
        std::env::set_var("ADMIN_API_SECRET", "cron-secret");
        assert!(Config::from_env().is_err());
        std::env::set_var("ADMIN_API_SECRET", "admin-secret");
    }
}
