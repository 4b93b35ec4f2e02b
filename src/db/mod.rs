pub mod models;
pub mod repository;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::errors::Result;

/// Owns the connection pool. Query methods live in [`repository`].
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(20)
            .connect(database_url)
            .await?;

        info!("🗄️ Database pool connected");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
