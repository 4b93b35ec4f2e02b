use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

use crate::errors::BotError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    pub database_url: String,

    // Exchange environment
    pub environment: EnvironmentType,

    // Encryption of API credentials at rest
    pub encryption_master_key: String,
    pub encryption_salt: String,

    // External cache, consumed by the HTTP read path
    pub redis_url: String,

    // Lifecycle
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentType {
    Production,
    Sandbox,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| BotError::Config("DATABASE_URL not set".into()))?,

            environment: Self::parse_environment(
                &env::var("ENVIRONMENT").unwrap_or_else(|_| "sandbox".to_string()),
            ),

            encryption_master_key: env::var("ENCRYPTION_MASTER_KEY")
                .map_err(|_| BotError::Config("ENCRYPTION_MASTER_KEY not set".into()))?,
            encryption_salt: env::var("ENCRYPTION_SALT")
                .map_err(|_| BotError::Config("ENCRYPTION_SALT not set".into()))?,

            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),

            shutdown_timeout_secs: env::var("SHUTDOWN_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
        })
    }

    fn parse_environment(environment: &str) -> EnvironmentType {
        match environment.to_lowercase().as_str() {
            "production" | "prod" | "live" => EnvironmentType::Production,
            _ => EnvironmentType::Sandbox,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.encryption_master_key.len() < 16 {
            return Err(
                BotError::Config("ENCRYPTION_MASTER_KEY must be at least 16 characters".into())
                    .into(),
            );
        }

        if self.shutdown_timeout_secs == 0 {
            return Err(BotError::Config("SHUTDOWN_TIMEOUT_SECS must be positive".into()).into());
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment, EnvironmentType::Production)
    }
}
