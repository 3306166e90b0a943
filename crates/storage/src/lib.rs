use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};
use tracing::debug;

use shared::domain::JobId;

/// Local persistence for the generation form and the results it produced.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewResult {
    pub job_id: JobId,
    pub seed: i64,
    pub prompt: String,
    pub image_path: String,
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredResult {
    pub id: i64,
    pub job_id: JobId,
    pub seed: i64,
    pub prompt: String,
    pub image_path: String,
    pub config: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Every in-memory connection is its own database.
        let max_connections = if database_url.starts_with("sqlite::memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS form_fields (
                name       TEXT PRIMARY KEY NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure form_fields table exists")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS job_results (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id      TEXT NOT NULL,
                seed        INTEGER NOT NULL,
                prompt      TEXT NOT NULL,
                image_path  TEXT NOT NULL,
                config_json TEXT NOT NULL,
                created_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure job_results table exists")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS job_results_job_id ON job_results (job_id)")
            .execute(&self.pool)
            .await
            .context("failed to ensure job_results index exists")?;

        Ok(())
    }

    pub async fn set_field(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO form_fields (name, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(name) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(name)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to persist form field '{name}'"))?;
        Ok(())
    }

    pub async fn field(&self, name: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM form_fields WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn fields(&self) -> Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT name, value FROM form_fields ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>(0), r.get::<String, _>(1)))
            .collect())
    }

    pub async fn clear_fields(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM form_fields")
            .execute(&self.pool)
            .await
            .context("failed to clear form fields")?;
        debug!(removed = done.rows_affected(), "storage: cleared form fields");
        Ok(done.rows_affected())
    }

    pub async fn record_result(&self, result: &NewResult) -> Result<i64> {
        let config_json = serde_json::to_string(&result.config)?;
        let rec = sqlx::query(
            "INSERT INTO job_results (job_id, seed, prompt, image_path, config_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?)
             RETURNING id",
        )
        .bind(result.job_id.as_str())
        .bind(result.seed)
        .bind(&result.prompt)
        .bind(&result.image_path)
        .bind(config_json)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to record result for job {}", result.job_id))?;
        Ok(rec.get::<i64, _>(0))
    }

    /// Newest first, matching the order thumbnails are shown in.
    pub async fn recent_results(&self, limit: u32) -> Result<Vec<StoredResult>> {
        let rows = sqlx::query(
            "SELECT id, job_id, seed, prompt, image_path, config_json, created_at
             FROM job_results ORDER BY id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(stored_result_from_row).collect()
    }

    pub async fn result_for_job(&self, job_id: &JobId) -> Result<Option<StoredResult>> {
        let row = sqlx::query(
            "SELECT id, job_id, seed, prompt, image_path, config_json, created_at
             FROM job_results WHERE job_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(stored_result_from_row).transpose()
    }
}

fn stored_result_from_row(r: &sqlx::sqlite::SqliteRow) -> Result<StoredResult> {
    let config_json: String = r.get(5);
    let config = serde_json::from_str::<Map<String, Value>>(&config_json)
        .context("stored result config is not a JSON object")?;
    Ok(StoredResult {
        id: r.get(0),
        job_id: JobId::new(r.get::<String, _>(1)),
        seed: r.get(2),
        prompt: r.get(3),
        image_path: r.get(4),
        config,
        created_at: r.get::<DateTime<Utc>, _>(6),
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
