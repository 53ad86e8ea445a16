//! Postgres task store: connection pool, migrations, health check, and
//! the task record operations.

use super::TaskStore;
use crate::error::{Error, Result};
use crate::model::{NewTask, Task, TaskId, TaskUpdate};
use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Database handle. Owns the connection pool for task records.
pub struct PgTaskStore {
    pool: PgPool,
}

impl PgTaskStore {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

const TASK_COLUMNS: &str = "id, query, status, result, owner, created_at, updated_at";

#[async_trait]
impl TaskStore for PgTaskStore {
    async fn create_task(&self, new: NewTask) -> Result<Task> {
        let row: TaskRow = sqlx::query_as(&format!(
            "INSERT INTO tasks (query, status, owner) VALUES ($1, 'pending', $2)
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(&new.query)
        .bind(&new.owner)
        .fetch_one(&self.pool)
        .await?;
        row.try_into_task()
    }

    async fn find_task(&self, id: TaskId) -> Result<Task> {
        let row: Option<TaskRow> =
            sqlx::query_as(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1"))
                .bind(id.0)
                .fetch_optional(&self.pool)
                .await?;

        row.ok_or_else(|| Error::NotFound(format!("task {id}")))?
            .try_into_task()
    }

    async fn update_task(&self, id: TaskId, update: TaskUpdate) -> Result<Task> {
        let row: Option<TaskRow> = sqlx::query_as(&format!(
            "UPDATE tasks SET status = $1, result = $2, updated_at = now()
             WHERE id = $3 AND ($4::text IS NULL OR status = $4)
             RETURNING {TASK_COLUMNS}"
        ))
        .bind(update.status.to_string())
        .bind(&update.result)
        .bind(id.0)
        .bind(update.expected.map(|s| s.to_string()))
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row.try_into_task(),
            // Either the id is unknown or the status moved under us.
            None => {
                let current = self.find_task(id).await?;
                Err(Error::InvalidTransition {
                    from: current.status.to_string(),
                    to: update.status.to_string(),
                })
            }
        }
    }

    async fn list_tasks_for_owner(&self, owner: &str) -> Result<Vec<Task>> {
        let rows: Vec<TaskRow> = sqlx::query_as(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE owner = $1 ORDER BY created_at, id"
        ))
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskRow::try_into_task).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct TaskRow {
    id: i64,
    query: String,
    status: String,
    result: Option<String>,
    owner: String,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl TaskRow {
    fn try_into_task(self) -> Result<Task> {
        Ok(Task {
            id: TaskId(self.id),
            query: self.query,
            status: self.status.parse()?,
            result: self.result,
            owner: self.owner,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
