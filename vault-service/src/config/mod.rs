use secrecy::SecretString;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub security: SecurityConfig,
    pub cache: CacheConfig,
    pub invitation_ttl_hours: i64,
    pub audit_archive_dir: PathBuf,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub tx_timeout_seconds: u64,
}

impl DatabaseConfig {
    pub fn tx_timeout(&self) -> Duration {
        Duration::from_secs(self.tx_timeout_seconds)
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    pub admin_api_key: SecretString,
    /// Master secret the value-encryption key is derived from.
    pub encryption_key: SecretString,
}

#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    pub ttl_short_seconds: u64,
    pub ttl_long_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_short_seconds: 300,
            ttl_long_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassLimit {
    pub requests: u32,
    pub window_seconds: u64,
}

impl ClassLimit {
    pub const fn new(requests: u32, window_seconds: u64) -> Self {
        Self {
            requests,
            window_seconds,
        }
    }
}

/// Per-actor limits for each operation class, plus the global per-IP guard.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub secret_read: ClassLimit,
    pub secret_write: ClassLimit,
    pub history: ClassLimit,
    pub audit: ClassLimit,
    pub membership: ClassLimit,
    pub invite: ClassLimit,
    pub org: ClassLimit,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            secret_read: ClassLimit::new(300, 60),
            secret_write: ClassLimit::new(300, 60),
            history: ClassLimit::new(100, 3600),
            audit: ClassLimit::new(100, 3600),
            membership: ClassLimit::new(300, 60),
            invite: ClassLimit::new(300, 60),
            org: ClassLimit::new(300, 60),
            global_ip_limit: 1000,
            global_ip_window_seconds: 60,
        }
    }
}

impl RateLimitConfig {
    fn classes(&self) -> [(&'static str, ClassLimit); 7] {
        [
            ("SECRET_READ", self.secret_read),
            ("SECRET_WRITE", self.secret_write),
            ("HISTORY", self.history),
            ("AUDIT", self.audit),
            ("MEMBERSHIP", self.membership),
            ("INVITE", self.invite),
            ("ORG", self.org),
        ]
    }
}

impl VaultConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;
        let defaults = RateLimitConfig::default();

        let config = VaultConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("vault-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
                tx_timeout_seconds: parse_env("DATABASE_TX_TIMEOUT_SECONDS", "10", is_prod)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://127.0.0.1:6379"), is_prod)?,
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
                admin_api_key: SecretString::new(get_env("ADMIN_API_KEY", None, is_prod)?),
                // Without a master secret nothing can be decrypted, so it is
                // mandatory in every environment.
                encryption_key: SecretString::new(get_env("ENCRYPTION_KEY", None, true)?),
            },
            cache: CacheConfig {
                ttl_short_seconds: parse_env("CACHE_TTL_SHORT_SECONDS", "300", is_prod)?,
                ttl_long_seconds: parse_env("CACHE_TTL_LONG_SECONDS", "600", is_prod)?,
            },
            invitation_ttl_hours: parse_env("INVITATION_TTL_HOURS", "12", is_prod)?,
            audit_archive_dir: PathBuf::from(get_env(
                "AUDIT_ARCHIVE_DIR",
                Some("./audit-archive"),
                is_prod,
            )?),
            rate_limit: RateLimitConfig {
                secret_read: class_limit("SECRET_READ", defaults.secret_read, is_prod)?,
                secret_write: class_limit("SECRET_WRITE", defaults.secret_write, is_prod)?,
                history: class_limit("HISTORY", defaults.history, is_prod)?,
                audit: class_limit("AUDIT", defaults.audit, is_prod)?,
                membership: class_limit("MEMBERSHIP", defaults.membership, is_prod)?,
                invite: class_limit("INVITE", defaults.invite, is_prod)?,
                org: class_limit("ORG", defaults.org, is_prod)?,
                global_ip_limit: parse_env("RATE_LIMIT_GLOBAL_IP_LIMIT", "1000", is_prod)?,
                global_ip_window_seconds: parse_env(
                    "RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS",
                    "60",
                    is_prod,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.database.tx_timeout_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_TX_TIMEOUT_SECONDS must be positive"
            )));
        }

        if self.invitation_ttl_hours <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "INVITATION_TTL_HOURS must be positive"
            )));
        }

        for (class, limit) in self.rate_limit.classes() {
            if limit.requests == 0 || limit.window_seconds == 0 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "RATE_LIMIT_{}_REQUESTS and RATE_LIMIT_{}_WINDOW_SECONDS must be positive",
                    class,
                    class
                )));
            }
        }

        if self.rate_limit.global_ip_limit == 0 || self.rate_limit.global_ip_window_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Global IP rate limit and window must be positive"
            )));
        }

        if self.environment == Environment::Prod
            && self.security.allowed_origins.iter().any(|o| o == "*")
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "Wildcard CORS origin not allowed in production"
            )));
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

fn class_limit(class: &str, default: ClassLimit, is_prod: bool) -> Result<ClassLimit, AppError> {
    Ok(ClassLimit {
        requests: parse_env(
            &format!("RATE_LIMIT_{}_REQUESTS", class),
            &default.requests.to_string(),
            is_prod,
        )?,
        window_seconds: parse_env(
            &format!("RATE_LIMIT_{}_WINDOW_SECONDS", class),
            &default.window_seconds.to_string(),
            is_prod,
        )?,
    })
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> VaultConfig {
        VaultConfig {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_name: "vault-service".to_string(),
            service_version: "0.1.0".to_string(),
            log_level: "info".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: "postgres://localhost/vault".to_string(),
                max_connections: 5,
                min_connections: 1,
                tx_timeout_seconds: 5,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            security: SecurityConfig {
                allowed_origins: vec!["*".to_string()],
                admin_api_key: SecretString::new("admin".to_string()),
                encryption_key: SecretString::new("master".to_string()),
            },
            cache: CacheConfig::default(),
            invitation_ttl_hours: 12,
            audit_archive_dir: PathBuf::from("./audit-archive"),
            rate_limit: RateLimitConfig::default(),
        }
    }

    #[test]
    fn wildcard_origin_is_rejected_only_in_prod() {
        let mut config = sample();
        assert!(config.validate().is_ok());
        config.environment = Environment::Prod;
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_rate_limit_window_is_rejected() {
        let mut config = sample();
        config.rate_limit.audit = ClassLimit::new(100, 0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn environment_parses_case_insensitively() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("staging".parse::<Environment>().is_err());
    }
}
