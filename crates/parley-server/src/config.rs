use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result, bail};

/// JWT secrets shipped in sample files that must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
    "secret",
];

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub redis_url: Option<String>,
    pub upload_dir: PathBuf,
    pub smtp: Option<SmtpConfig>,
    pub public_url: String,
    pub ffprobe: String,
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub user: String,
    pub password: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        let jwt_secret = var("PARLEY_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("PARLEY_JWT_SECRET is unset or still a placeholder; set it in your .env file");
        }

        let port = match var("PARLEY_PORT") {
            Some(p) => p.parse().with_context(|| format!("PARLEY_PORT is not a port: {}", p))?,
            None => 3000,
        };

        let smtp = match (var("PARLEY_SMTP_HOST"), var("PARLEY_SMTP_USER"), var("PARLEY_SMTP_PASSWORD")) {
            (Some(host), Some(user), Some(password)) => Some(SmtpConfig { host, user, password }),
            (None, None, None) => None,
            _ => bail!("PARLEY_SMTP_HOST, PARLEY_SMTP_USER and PARLEY_SMTP_PASSWORD must be set together"),
        };

        Ok(Self {
            host: var("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: var("PARLEY_DB_PATH").unwrap_or_else(|| "parley.db".into()).into(),
            jwt_secret,
            redis_url: var("PARLEY_REDIS_URL"),
            upload_dir: var("PARLEY_UPLOAD_DIR").unwrap_or_else(|| "./uploads".into()).into(),
            smtp,
            public_url: var("PARLEY_PUBLIC_URL").unwrap_or_else(|| "http://localhost:3000".into()),
            ffprobe: var("PARLEY_FFPROBE").unwrap_or_else(|| "ffprobe".into()),
        })
    }

    pub fn addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }
}
