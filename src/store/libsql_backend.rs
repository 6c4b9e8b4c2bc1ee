//! libSQL backend — async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! reused for all operations; each claim is one `UPDATE … WHERE status = ?`
//! statement, which SQLite applies atomically.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::params::Params;
use libsql::{Connection, Database as LibSqlDatabase, Value, params};
use rust_decimal::Decimal;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::TaskStore;
use crate::tasks::model::{Task, TaskPatch, TaskStatus};

/// Column order read by `row_to_task`.
const TASK_COLUMNS: &str = "id, thread_id, intent, autonomy_level, summary, original_message, \
     execution_prompt, clarify_question, status, session_id, result, cost_units, attachments, \
     created_at, started_at, completed_at, updated_at";

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        migrations::run_migrations(backend.conn()).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_tasks(
        &self,
        sql: &str,
        params: Params,
        context: &str,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{context}: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => tasks.push(row_to_task(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{context} row: {e}"))),
            }
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so that lexical order matches chronological order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn parse_optional_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.filter(|s| !s.is_empty()).map(|s| parse_datetime(&s))
}

fn optional_text(value: Option<String>) -> Value {
    value.map(Value::Text).unwrap_or(Value::Null)
}

/// Translate a patch into `(column, value)` pairs, always touching `updated_at`.
fn patch_columns(patch: TaskPatch) -> Vec<(&'static str, Value)> {
    let mut columns = Vec::new();
    if let Some(status) = patch.status {
        columns.push(("status", Value::Text(status.as_str().to_string())));
    }
    if let Some(prompt) = patch.execution_prompt {
        columns.push(("execution_prompt", Value::Text(prompt)));
    }
    if let Some(session_id) = patch.session_id {
        columns.push(("session_id", Value::Text(session_id)));
    }
    if let Some(result) = patch.result {
        columns.push(("result", Value::Text(result)));
    }
    if let Some(cost) = patch.cost_units {
        columns.push(("cost_units", Value::Text(cost.to_string())));
    }
    if let Some(started_at) = patch.started_at {
        columns.push((
            "started_at",
            optional_text(started_at.as_ref().map(format_datetime)),
        ));
    }
    if let Some(completed_at) = patch.completed_at {
        columns.push((
            "completed_at",
            optional_text(completed_at.as_ref().map(format_datetime)),
        ));
    }
    columns.push(("updated_at", Value::Text(format_datetime(&Utc::now()))));
    columns
}

/// Build `UPDATE tasks SET … WHERE id = ?` (plus an optional status guard).
fn build_update(
    id: Uuid,
    patch: TaskPatch,
    expected: Option<TaskStatus>,
) -> (String, Vec<Value>) {
    let columns = patch_columns(patch);
    let mut values = Vec::with_capacity(columns.len() + 2);
    let assignments: Vec<String> = columns
        .into_iter()
        .enumerate()
        .map(|(i, (column, value))| {
            values.push(value);
            format!("{column} = ?{}", i + 1)
        })
        .collect();

    let mut sql = format!(
        "UPDATE tasks SET {} WHERE id = ?{}",
        assignments.join(", "),
        values.len() + 1
    );
    values.push(Value::Text(id.to_string()));

    if let Some(expected) = expected {
        sql.push_str(&format!(" AND status = ?{}", values.len() + 1));
        values.push(Value::Text(expected.as_str().to_string()));
    }
    (sql, values)
}

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("task.id: {e}")))?;
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("task.id parse: {e}")))?;

    let thread_id: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("task.thread_id: {e}")))?;
    let intent: String = row.get(2).unwrap_or_default();
    let autonomy_level: String = row.get(3).unwrap_or_default();
    let summary: String = row.get(4).unwrap_or_default();
    let original_message: String = row.get(5).unwrap_or_default();
    let execution_prompt: String = row.get(6).unwrap_or_default();
    let clarify_question: Option<String> = row.get(7).ok();

    let status_str: String = row
        .get(8)
        .map_err(|e| DatabaseError::Query(format!("task.status: {e}")))?;
    let status = TaskStatus::from_str(&status_str).map_err(DatabaseError::Serialization)?;

    let session_id: Option<String> = row.get(9).ok();
    let result: Option<String> = row.get(10).ok();

    let cost_str: Option<String> = row.get(11).ok();
    let cost_units = cost_str
        .filter(|s| !s.is_empty())
        .and_then(|s| Decimal::from_str(&s).ok());

    let attachments_str: String = row.get(12).unwrap_or_else(|_| "[]".to_string());
    let attachments: Vec<String> = serde_json::from_str(&attachments_str).unwrap_or_default();

    let created_str: String = row
        .get(13)
        .map_err(|e| DatabaseError::Query(format!("task.created_at: {e}")))?;
    let started_at = parse_optional_datetime(row.get(14).ok());
    let completed_at = parse_optional_datetime(row.get(15).ok());
    let updated_str: String = row.get(16).unwrap_or_else(|_| created_str.clone());

    Ok(Task {
        id,
        thread_id,
        intent,
        autonomy_level,
        summary,
        original_message,
        execution_prompt,
        clarify_question,
        status,
        session_id,
        result,
        cost_units,
        attachments,
        created_at: parse_datetime(&created_str),
        started_at,
        completed_at,
        updated_at: parse_datetime(&updated_str),
    })
}

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn insert(&self, task: &Task) -> Result<Uuid, DatabaseError> {
        let attachments = serde_json::to_string(&task.attachments)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        self.conn()
            .execute(
                &format!(
                    "INSERT INTO tasks ({TASK_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)"
                ),
                params![
                    task.id.to_string(),
                    task.thread_id.as_str(),
                    task.intent.as_str(),
                    task.autonomy_level.as_str(),
                    task.summary.as_str(),
                    task.original_message.as_str(),
                    task.execution_prompt.as_str(),
                    task.clarify_question.clone(),
                    task.status.as_str(),
                    task.session_id.clone(),
                    task.result.clone(),
                    task.cost_units.map(|c| c.to_string()),
                    attachments,
                    format_datetime(&task.created_at),
                    task.started_at.as_ref().map(format_datetime),
                    task.completed_at.as_ref().map(format_datetime),
                    format_datetime(&task.updated_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        debug!(task_id = %task.id, status = %task.status, "Task inserted");
        Ok(task.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                Params::Positional(vec![Value::Text(id.to_string())]),
                "get_task",
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn oldest_by_status(&self, status: TaskStatus) -> Result<Option<Task>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 \
                     ORDER BY created_at ASC, rowid ASC LIMIT 1"
                ),
                Params::Positional(vec![Value::Text(status.as_str().to_string())]),
                "oldest_by_status",
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn all_by_status(&self, status: TaskStatus) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 \
                 ORDER BY created_at ASC, rowid ASC"
            ),
            Params::Positional(vec![Value::Text(status.as_str().to_string())]),
            "all_by_status",
        )
        .await
    }

    async fn claim(
        &self,
        id: Uuid,
        expected: TaskStatus,
        new: TaskStatus,
        extra: TaskPatch,
    ) -> Result<bool, DatabaseError> {
        if !expected.can_transition_to(new) {
            return Err(DatabaseError::Constraint(format!(
                "illegal transition {expected} -> {new} for task {id}"
            )));
        }

        let patch = TaskPatch {
            status: Some(new),
            ..extra
        };
        let (sql, values) = build_update(id, patch, Some(expected));
        let changed = self
            .conn()
            .execute(&sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_task: {e}")))?;

        debug!(task_id = %id, from = %expected, to = %new, claimed = changed == 1, "Claim attempted");
        Ok(changed == 1)
    }

    async fn update(&self, id: Uuid, patch: TaskPatch) -> Result<(), DatabaseError> {
        let (sql, values) = build_update(id, patch, None);
        let changed = self
            .conn()
            .execute(&sql, Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "task".to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn latest_for_thread(
        &self,
        thread_id: &str,
        statuses: &[TaskStatus],
    ) -> Result<Option<Task>, DatabaseError> {
        if statuses.is_empty() {
            return Ok(None);
        }

        let placeholders: Vec<String> = (0..statuses.len()).map(|i| format!("?{}", i + 2)).collect();
        let mut values = vec![Value::Text(thread_id.to_string())];
        values.extend(statuses.iter().map(|s| Value::Text(s.as_str().to_string())));

        let mut tasks = self
            .query_tasks(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE thread_id = ?1 AND status IN ({}) \
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    placeholders.join(", ")
                ),
                Params::Positional(values),
                "latest_for_thread",
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn list_recent(&self, limit: usize) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, rowid DESC LIMIT ?1"
            ),
            Params::Positional(vec![Value::Integer(limit as i64)]),
            "list_recent",
        )
        .await
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<usize, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM tasks WHERE status = ?1",
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_by_status: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("count_by_status row: {e}")))?;
                Ok(count as usize)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_by_status row: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::Classification;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_task(thread: &str, prompt: &str) -> Task {
        Task::new(
            thread,
            prompt,
            Classification {
                intent: "general".into(),
                autonomy_level: "auto".into(),
                summary: prompt.into(),
                execution_prompt: prompt.into(),
                clarify_question: None,
            },
        )
    }

    #[tokio::test]
    async fn insert_and_get() {
        let db = test_db().await;
        let task = make_task("th-1", "Do X").with_attachments(vec!["/tmp/a.txt".into()]);
        let id = db.insert(&task).await.unwrap();

        let fetched = db.get(id).await.unwrap().unwrap();
        assert_eq!(fetched.id, task.id);
        assert_eq!(fetched.thread_id, "th-1");
        assert_eq!(fetched.status, TaskStatus::Queued);
        assert_eq!(fetched.execution_prompt, "Do X");
        assert_eq!(fetched.attachments, vec!["/tmp/a.txt".to_string()]);
        assert!(fetched.session_id.is_none());
        assert!(fetched.started_at.is_none());
        assert_eq!(
            format_datetime(&fetched.created_at),
            format_datetime(&task.created_at)
        );
    }

    #[tokio::test]
    async fn get_not_found() {
        let db = test_db().await;
        assert!(db.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oldest_by_status_is_fifo() {
        let db = test_db().await;
        let base = Utc::now();
        let newer = make_task("a", "newer").with_created_at(base);
        let older = make_task("b", "older").with_created_at(base - Duration::seconds(10));
        db.insert(&newer).await.unwrap();
        db.insert(&older).await.unwrap();

        let oldest = db.oldest_by_status(TaskStatus::Queued).await.unwrap().unwrap();
        assert_eq!(oldest.id, older.id);
        assert!(db.oldest_by_status(TaskStatus::Running).await.unwrap().is_none());

        let all = db.all_by_status(TaskStatus::Queued).await.unwrap();
        assert_eq!(all.iter().map(|t| t.id).collect::<Vec<_>>(), vec![older.id, newer.id]);
    }

    #[tokio::test]
    async fn claim_succeeds_once() {
        let db = test_db().await;
        let task = make_task("a", "x");
        db.insert(&task).await.unwrap();

        let now = Utc::now();
        let first = db
            .claim(task.id, TaskStatus::Queued, TaskStatus::Running, TaskPatch::new().started_at(Some(now)))
            .await
            .unwrap();
        let second = db
            .claim(task.id, TaskStatus::Queued, TaskStatus::Running, TaskPatch::new().started_at(Some(now)))
            .await
            .unwrap();
        assert!(first);
        assert!(!second);

        let fetched = db.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Running);
        assert!(fetched.started_at.is_some());
    }

    #[tokio::test]
    async fn simultaneous_claims_have_one_winner() {
        let db = Arc::new(test_db().await);
        let task = make_task("a", "x");
        db.insert(&task).await.unwrap();

        let (a, b) = tokio::join!(
            db.claim(task.id, TaskStatus::Queued, TaskStatus::Running, TaskPatch::new()),
            db.claim(task.id, TaskStatus::Queued, TaskStatus::Running, TaskPatch::new()),
        );
        let wins = [a.unwrap(), b.unwrap()].iter().filter(|w| **w).count();
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn claim_rejects_illegal_transition() {
        let db = test_db().await;
        let task = make_task("a", "x");
        db.insert(&task).await.unwrap();

        let err = db
            .claim(task.id, TaskStatus::Rejected, TaskStatus::Running, TaskPatch::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn update_writes_outcome_and_clears_timestamps() {
        let db = test_db().await;
        let task = make_task("a", "x");
        db.insert(&task).await.unwrap();
        db.claim(
            task.id,
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskPatch::new().started_at(Some(Utc::now())),
        )
        .await
        .unwrap();

        db.update(
            task.id,
            TaskPatch::new()
                .status(TaskStatus::Completed)
                .session_id("s1")
                .result("done")
                .cost_units(dec!(0.0421))
                .completed_at(Some(Utc::now())),
        )
        .await
        .unwrap();

        let fetched = db.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, TaskStatus::Completed);
        assert_eq!(fetched.session_id.as_deref(), Some("s1"));
        assert_eq!(fetched.result.as_deref(), Some("done"));
        assert_eq!(fetched.cost_units, Some(dec!(0.0421)));
        assert!(fetched.completed_at.is_some());

        db.update(task.id, TaskPatch::new().started_at(None)).await.unwrap();
        let fetched = db.get(task.id).await.unwrap().unwrap();
        assert!(fetched.started_at.is_none());
        // Untouched by a patch that doesn't mention it
        assert_eq!(fetched.session_id.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn update_missing_task_is_not_found() {
        let db = test_db().await;
        let err = db
            .update(Uuid::new_v4(), TaskPatch::new().result("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn latest_for_thread_filters_status() {
        let db = test_db().await;
        let base = Utc::now();
        let first = make_task("th", "first").with_created_at(base - Duration::seconds(5));
        let second = make_task("th", "second").with_created_at(base);
        let other = make_task("elsewhere", "other");
        for t in [&first, &second, &other] {
            db.insert(t).await.unwrap();
        }
        db.claim(second.id, TaskStatus::Queued, TaskStatus::Rejected, TaskPatch::new())
            .await
            .unwrap();

        let statuses = [TaskStatus::Queued, TaskStatus::Completed];
        let found = db.latest_for_thread("th", &statuses).await.unwrap().unwrap();
        assert_eq!(found.id, first.id);

        let found = db.latest_for_thread("th", &TaskStatus::ALL).await.unwrap().unwrap();
        assert_eq!(found.id, second.id);

        assert!(db.latest_for_thread("th", &[]).await.unwrap().is_none());
        assert!(db.latest_for_thread("nope", &statuses).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_and_counts() {
        let db = test_db().await;
        let base = Utc::now();
        for i in 0..3 {
            let t = make_task("th", &format!("t{i}")).with_created_at(base + Duration::seconds(i));
            db.insert(&t).await.unwrap();
        }
        let recent = db.list_recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].original_message, "t2");
        assert_eq!(db.count_by_status(TaskStatus::Queued).await.unwrap(), 3);
        assert_eq!(db.count_by_status(TaskStatus::Running).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn new_local_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("inbox.db");
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        db.insert(&make_task("a", "x")).await.unwrap();
        assert!(path.exists());
    }
}
