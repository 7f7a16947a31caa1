//! Connection pool setup and schema migrations.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use toolgate_core::GatewayError;

const SCHEMA: &str = include_str!("schema.sql");

pub async fn init_pool(db_path: &str) -> Result<SqlitePool, GatewayError> {
    let options = SqliteConnectOptions::new().filename(db_path).create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await
        .map_err(|e| GatewayError::Internal(format!("failed to open sqlite pool: {e}")))?;
    run_migrations(&pool).await?;
    Ok(pool)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), GatewayError> {
    for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| GatewayError::Internal(format!("migration failed: {e}")))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_run_against_an_in_memory_db() {
        let pool = init_pool(":memory:").await.unwrap();
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM servers")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(row.0, 0);
    }
}
