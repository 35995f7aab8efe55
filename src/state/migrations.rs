//! Database migration helpers.
//!
//! Applies the state schema once per database and records every applied
//! step in a `_migrations` table.

use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use super::schema;

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Database query failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration script failed to execute.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),
}

/// Migration runner for applying schema changes.
pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Runs all pending migrations.
    ///
    /// Idempotent: applied steps are skipped and every statement uses
    /// `IF NOT EXISTS`.
    pub async fn run_migrations(&self) -> Result<(), MigrationError> {
        self.ensure_migrations_table().await?;

        for (idx, statement) in schema::all_schema_statements().iter().enumerate() {
            let name = migration_name(idx);
            if !self.is_migration_applied(&name).await? {
                self.apply_migration(&name, statement).await?;
                info!(migration = %name, "Applied migration");
            }
        }

        Ok(())
    }

    /// Moves the session id sequence so the next id is at least `starting_id`.
    ///
    /// Never moves the sequence backwards.
    pub async fn seed_session_ids(&self, starting_id: i64) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            SELECT CASE
                WHEN target < 1 THEN setval('session_id_seq', 1, false)
                ELSE setval('session_id_seq', target, true)
            END
            FROM (
                SELECT GREATEST(
                    $1 - 1,
                    (SELECT CASE WHEN is_called THEN last_value ELSE last_value - 1 END
                     FROM session_id_seq)
                ) AS target
            ) AS t
            "#,
        )
        .bind(starting_id.max(1))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_migrations_table(&self) -> Result<(), MigrationError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_migration_applied(&self, name: &str) -> Result<bool, MigrationError> {
        let row: Option<(i32,)> = sqlx::query_as("SELECT id FROM _migrations WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    async fn apply_migration(&self, name: &str, sql: &str) -> Result<(), MigrationError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| MigrationError::MigrationFailed(format!("{}: {}", name, e)))?;

        sqlx::query("INSERT INTO _migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(())
    }
}

fn migration_name(idx: usize) -> String {
    format!("state_v1_part_{}", idx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_names_are_stable() {
        assert_eq!(migration_name(0), "state_v1_part_0");
        assert_eq!(migration_name(5), "state_v1_part_5");
    }

    #[test]
    fn test_migration_error_display() {
        let err = MigrationError::MigrationFailed("state_v1_part_2: syntax".to_string());
        assert!(err.to_string().contains("state_v1_part_2"));
    }
}
