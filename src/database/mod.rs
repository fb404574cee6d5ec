use crate::config::DatabaseConfig;
use anyhow::Result;
use sqlx::{migrate::MigrateDatabase, Pool, Sqlite, SqlitePool};
use tracing::info;

/// Embedded migrations, applied in order at startup.
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial_schema.sql",
    include_str!("../../migrations/001_initial_schema.sql"),
)];

#[derive(Clone)]
pub struct Database {
    pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        // Create database if it doesn't exist (for SQLite)
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            Sqlite::create_database(&config.url).await?;
        }

        let pool = SqlitePool::connect(&config.url).await?;

        Ok(Self { pool })
    }

    /// Connect to an in-memory database, used by tests. A single pooled
    /// connection that never expires, because each SQLite in-memory
    /// connection is its own database.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS _applied_migrations (
                name TEXT PRIMARY KEY,
                installed_on TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        for (name, content) in MIGRATIONS {
            let existing = sqlx::query_scalar::<_, i64>(
                "SELECT COUNT(*) FROM _applied_migrations WHERE name = ?",
            )
            .bind(name)
            .fetch_one(&self.pool)
            .await?;

            if existing > 0 {
                continue;
            }

            let start = std::time::Instant::now();
            let mut transaction = self.pool.begin().await?;

            // A migration file may hold several statements.
            for statement in content.split(';') {
                let statement = statement.trim();
                if statement.is_empty() {
                    continue;
                }
                sqlx::query(statement).execute(&mut *transaction).await?;
            }

            sqlx::query("INSERT INTO _applied_migrations (name) VALUES (?)")
                .bind(name)
                .execute(&mut *transaction)
                .await?;

            transaction.commit().await?;
            info!(
                "Applied migration: {} ({}ms)",
                name,
                start.elapsed().as_millis()
            );
        }

        Ok(())
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}
