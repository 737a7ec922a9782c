//! Server configuration
//!
//! Loaded once at startup from environment variables. Required values fail
//! fast with a named error; optional ones carry development defaults.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Postgres connection string.
    pub database_url: String,
    /// Address the HTTP server binds, e.g. `0.0.0.0:8080`.
    pub bind_address: String,
    /// Secret for verifying bearer JWTs.
    pub jwt_secret: String,
    /// Comma-separated CORS origin allowlist.
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("missing required environment variable: {0}")]
pub struct MissingEnv(&'static str);

fn required(name: &'static str) -> Result<String, MissingEnv> {
    std::env::var(name).map_err(|_| MissingEnv(name))
}

impl Config {
    pub fn from_env() -> Result<Self, MissingEnv> {
        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            jwt_secret: required("JWT_SECRET")?,
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "http://localhost:3000".to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        })
    }
}
