use std::sync::Arc;

use config::DatabaseConfig;
use thiserror::Error;

use crate::{
    migrations::MIGRATOR,
    repository::{create_pg_pool, PgStorage},
};

#[derive(Debug, Error)]
pub enum InfrastructureError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[derive(Clone)]
pub struct Infrastructure {
    pub storage: Arc<PgStorage>,
}

impl Infrastructure {
    /// 建立连接池并执行迁移
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, InfrastructureError> {
        let pool = create_pg_pool(&config.url, config.max_connections).await?;
        MIGRATOR.run(&pool).await?;
        tracing::info!(max_connections = config.max_connections, "database ready");

        Ok(Self {
            storage: Arc::new(PgStorage::new(pool)),
        })
    }
}
